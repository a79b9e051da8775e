//! Bots and their per-match statistics.

use std::path::PathBuf;
use std::sync::Mutex;

/// Scoring counters for one bot, mutated by the console event handlers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Kills scored against other bots.
    pub frags: u32,
    /// Self-inflicted deaths (lava, own grenade, ...).
    pub suicides: u32,
    /// Deaths at the hands of another bot.
    pub deaths: u32,
}

impl Stats {
    /// Fraction of engagements this bot died in. Always in `[0, 1)`.
    pub fn death_factor(&self) -> f64 {
        f64::from(self.deaths + self.suicides)
            / (1.0 + f64::from(self.deaths + self.suicides + self.frags))
    }

    /// Fraction of this bot's own kills that were self-inflicted.
    pub fn suicide_factor(&self) -> f64 {
        f64::from(self.suicides) / (1.0 + f64::from(self.suicides + self.frags))
    }

    /// Scalar fitness reported back to the GP server.
    ///
    /// `(1 + frags) * (1 - death_factor) * (1 - suicide_factor)`, rewarding
    /// kills and punishing deaths, with suicides weighed twice. The `+1`
    /// terms keep every denominator nonzero.
    pub fn fitness(&self) -> f64 {
        (1.0 + f64::from(self.frags)) * (1.0 - self.death_factor()) * (1.0 - self.suicide_factor())
    }
}

/// One competing bot across its lifetime in a match.
///
/// Created when its source arrives from the GP server, compiled by the
/// [`Builder`](crate::builder::Builder), launched through a
/// [`BotChannel`](crate::bot_channel::BotChannel), scored by the console
/// dispatcher, and discarded once its fitness has been reported.
#[derive(Debug)]
pub struct Bot {
    /// Name, unique within a match; also the in-game player name.
    pub name: String,
    /// Source code as received from the GP server.
    pub code: String,
    /// Compiled executable, set by the builder. `None` means the bot
    /// cannot be launched and is excluded from the match.
    pub exe: Option<PathBuf>,
    /// Generated source file, kept so the builder can clean it up.
    pub src_file: Option<PathBuf>,
    /// Live counters; locked because the console poller writes while the
    /// orchestrator reads.
    pub stats: Mutex<Stats>,
}

impl Bot {
    /// Create a not-yet-compiled bot.
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Bot {
        Bot {
            name: name.into(),
            code: code.into(),
            exe: None,
            src_file: None,
            stats: Mutex::new(Stats::default()),
        }
    }

    /// Copy of the current counters.
    pub fn stats(&self) -> Stats {
        *self.stats.lock().expect("poisoned")
    }
}

impl PartialEq for Bot {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Bot {}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    #[test]
    fn fresh_stats_have_unit_fitness() {
        let stats = Stats::default();
        assert!((stats.death_factor() - 0.0).abs() < EPS);
        assert!((stats.suicide_factor() - 0.0).abs() < EPS);
        assert!((stats.fitness() - 1.0).abs() < EPS);
    }

    #[test]
    fn fitness_rewards_frags_and_punishes_deaths() {
        let stats = Stats {
            frags: 5,
            deaths: 2,
            suicides: 1,
        };
        // death_factor = (2+1)/(1+2+1+5) = 3/9
        assert!((stats.death_factor() - 3.0 / 9.0).abs() < EPS);
        // suicide_factor = 1/(1+1+5) = 1/7
        assert!((stats.suicide_factor() - 1.0 / 7.0).abs() < EPS);
        // fitness = 6 * (6/9) * (6/7)
        assert!((stats.fitness() - 6.0 * (6.0 / 9.0) * (6.0 / 7.0)).abs() < EPS);
    }

    #[test]
    fn pure_fragger_outscores_a_suicidal_bot() {
        let fragger = Stats {
            frags: 4,
            deaths: 0,
            suicides: 0,
        };
        let kamikaze = Stats {
            frags: 4,
            deaths: 0,
            suicides: 4,
        };
        assert!(fragger.fitness() > kamikaze.fitness());
        // A bot that never dies keeps its full 1 + frags score.
        assert!((fragger.fitness() - 5.0).abs() < EPS);
        // kamikaze: both factors are 4/9.
        assert!((kamikaze.fitness() - 5.0 * (5.0 / 9.0) * (5.0 / 9.0)).abs() < EPS);
    }

    #[test]
    fn factors_stay_below_one() {
        let stats = Stats {
            frags: 0,
            deaths: 1000,
            suicides: 1000,
        };
        assert!(stats.death_factor() < 1.0);
        assert!(stats.suicide_factor() < 1.0);
        assert!(stats.fitness() > 0.0);
    }
}
