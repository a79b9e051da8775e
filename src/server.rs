//! Game-server process lifecycle and per-match orchestration.
//!
//! [`GameServer`] owns the dedicated Quake 2 server process across matches:
//! it launches q2ded with computed arguments, waits for the console poller
//! to report the one-shot "Server Initialized" signal, and drives each
//! match through the sequence launch bots → connect → start → run out the
//! clock → stop → disconnect → quit. A match failure is handled one level
//! up (see [`Harness`](crate::client::Harness)): kill everything through
//! the process registry, relaunch the server, discard the results.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, error, info, trace, warn};

use crate::bot::{Bot, Stats};
use crate::bot_channel::BotChannel;
use crate::configuration::Configuration;
use crate::console::{ConsolePoller, Roster};
use crate::registry::ProcessRegistry;

/// Quake 2 deathmatch flags, combined by addition into the `dmflags`
/// option.
pub mod dm_flags {
    #![allow(missing_docs)]
    pub const NO_HEALTH: u32 = 1;
    pub const NO_POWERUPS: u32 = 2;
    pub const WEAPONS_STAY: u32 = 4;
    pub const NO_FALL_DAMAGE: u32 = 8;
    pub const INSTANT_POWERUPS: u32 = 16;
    pub const SAME_MAP: u32 = 32;
    pub const TEAMS_BY_SKIN: u32 = 64;
    pub const TEAMS_BY_MODEL: u32 = 128;
    pub const NO_FRIENDLY_FIRE: u32 = 256;
    pub const SPAWN_FARTHEST: u32 = 512;
    pub const FORCE_RESPAWN: u32 = 1024;
    pub const NO_ARMOR: u32 = 2048;
    pub const ALLOW_EXIT: u32 = 4096;
    pub const INFINITE_AMMO: u32 = 8192;
    pub const QUAD_DROP: u32 = 16384;
    pub const FIXED_FOV: u32 = 32768;
}

/// Where the orchestrator currently is in the per-match lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    /// No match in progress (the server process may still be up).
    Idle,
    /// Spawning q2ded.
    Launching,
    /// Blocked on the one-shot readiness signal.
    AwaitingReady,
    /// Bots are in the game and the clock is running.
    Running,
    /// Freezing and disconnecting bots.
    WindingDown,
}

fn transition(state: &mut MatchState, next: MatchState) {
    trace!("match state: {:?} -> {:?}", *state, next);
    *state = next;
}

struct MatchSession {
    proc: Child,
    poller: ConsolePoller,
    roster: Roster,
    channels: HashMap<String, BotChannel>,
}

/// Orchestrator for the dedicated server process and its matches.
pub struct GameServer {
    q2ded: PathBuf,
    baseq2: PathBuf,
    game_port: u16,
    registry: Arc<ProcessRegistry>,
    session: Option<MatchSession>,
    state: MatchState,
}

impl GameServer {
    /// Create an orchestrator from the configured paths. Nothing is
    /// spawned until [`launch`](GameServer::launch).
    pub fn new(config: &Configuration, registry: Arc<ProcessRegistry>) -> GameServer {
        GameServer {
            q2ded: config.q2ded.clone(),
            baseq2: config.baseq2.clone(),
            game_port: config.game_port,
            registry,
            session: None,
            state: MatchState::Idle,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MatchState {
        self.state
    }

    /// Path of the console log this orchestrator tails.
    pub fn console_path(&self) -> PathBuf {
        self.baseq2.join("qconsole.log")
    }

    /// Launch q2ded on `map` and block until it reports initialized.
    ///
    /// Arguments are `+map <map>` followed by `+set <key> <value>` for the
    /// fixed basedir/logfile/dedicated options and every entry of
    /// `options`. The readiness wait is unbounded because server startup
    /// time depends on the host, but it fails fast if the console poller
    /// dies.
    pub fn launch(&mut self, options: &[(String, String)], map: &str) -> anyhow::Result<()> {
        if self.session.is_some() {
            anyhow::bail!("a game server is already running");
        }
        transition(&mut self.state, MatchState::Launching);

        self.clear_console()
            .context("could not reset the console log")?;

        let basedir = self
            .q2ded
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let fixed = [
            ("basedir".to_string(), basedir.display().to_string()),
            ("logfile".to_string(), "2".to_string()),
            ("dedicated".to_string(), "1".to_string()),
        ];

        let mut command = Command::new(&self.q2ded);
        command.arg("+map").arg(map);
        info!("game parameters:");
        for (key, value) in fixed.iter().chain(options.iter()) {
            command.arg("+set").arg(key).arg(value);
            info!("\t{key}:\t{value}");
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let proc = command
            .spawn()
            .with_context(|| format!("could not launch q2ded ({})", self.q2ded.display()))?;
        self.registry.track(proc.id(), "q2ded");
        info!("launched q2ded with pid = {}", proc.id());

        let roster: Roster = Arc::new(Mutex::new(HashMap::new()));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let poller = ConsolePoller::start(self.console_path(), roster.clone(), ready_tx)?;

        self.session = Some(MatchSession {
            proc,
            poller,
            roster,
            channels: HashMap::new(),
        });

        transition(&mut self.state, MatchState::AwaitingReady);
        ready_rx
            .recv()
            .context("console poller stopped before the server initialized")?;
        transition(&mut self.state, MatchState::Idle);
        Ok(())
    }

    /// Run one match: admit `entrants`, let them fight for `time_limit`,
    /// wind down, and return every admitted bot's final stats.
    ///
    /// Bots without an executable, or whose process cannot be spawned, are
    /// excluded with a warning. Any RPC failure after admission fails the
    /// match; the caller is expected to discard the results and recover.
    pub fn run_match(
        &mut self,
        time_limit: Duration,
        entrants: &[Arc<Bot>],
    ) -> anyhow::Result<Vec<(String, Stats)>> {
        let port = self.game_port;
        let session = self
            .session
            .as_mut()
            .context("no game server session: call launch first")?;
        session.roster.lock().expect("poisoned").clear();
        session.channels.clear();

        info!("launching bots:");
        for bot in entrants {
            if bot.exe.is_none() {
                warn!("\t{}: no executable, excluded from the match", bot.name);
                continue;
            }
            let channel = match BotChannel::launch(bot, &self.registry) {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(
                        "\t{}: launch failed, excluded from the match: {e:#}",
                        bot.name
                    );
                    continue;
                }
            };
            info!("\t{}:\tlaunched", bot.name);

            channel
                .connect("localhost", port)
                .with_context(|| format!("bot {} failed to connect", bot.name))?;
            info!("\t{}:\tconnected", bot.name);

            session
                .roster
                .lock()
                .expect("poisoned")
                .insert(bot.name.clone(), bot.clone());
            session.channels.insert(bot.name.clone(), channel);
        }

        if session.channels.is_empty() {
            warn!("no bots could be launched, skipping the match");
            return Ok(Vec::new());
        }
        info!("all bots have entered the game, starting the competition");

        for (name, channel) in &session.channels {
            debug!("starting {name}");
            channel
                .start()
                .with_context(|| format!("bot {name} failed to start"))?;
        }

        transition(&mut self.state, MatchState::Running);
        thread::sleep(time_limit);
        info!("time is up, ending game");
        transition(&mut self.state, MatchState::WindingDown);

        // Freeze everyone before anyone is disconnected: teardown takes a
        // few seconds per bot, and a still-fighting bot would rack up
        // frags the others can no longer answer.
        for (name, channel) in &session.channels {
            debug!("stopping {name}");
            channel
                .stop()
                .with_context(|| format!("bot {name} failed to stop"))?;
        }

        for (name, channel) in &session.channels {
            info!("\t{name}:\tdisconnecting");
            channel
                .disconnect()
                .with_context(|| format!("bot {name} failed to disconnect"))?;
            debug!("\t\t\tquitting");
            channel
                .quit()
                .with_context(|| format!("bot {name} failed to quit"))?;
        }
        session.channels.clear();

        let results = session
            .roster
            .lock()
            .expect("poisoned")
            .iter()
            .map(|(name, bot)| (name.clone(), bot.stats()))
            .collect();
        transition(&mut self.state, MatchState::Idle);
        Ok(results)
    }

    /// Disconnect every bot and bring the server process down.
    ///
    /// A defunct bot never blocks cleanup of the others. Calling this with
    /// no live session is a warning, not an error.
    pub fn kill(&mut self) -> anyhow::Result<()> {
        let Some(mut session) = self.session.take() else {
            warn!("received kill request, but no game server is running");
            return Ok(());
        };
        transition(&mut self.state, MatchState::WindingDown);

        let already_dead = matches!(session.proc.try_wait(), Ok(Some(_)));
        if already_dead {
            error!("received kill request, but the server has already stopped");
        } else {
            info!("kill request received, disconnecting bots...");
        }

        for (name, channel) in session.channels.drain() {
            if let Err(e) = channel.disconnect().and_then(|_| channel.quit()) {
                error!("bot {name} is defunct, continuing: {e}");
            }
            info!("\t{name} left game");
        }

        session.poller.stop();

        let pid = session.proc.id();
        if !already_dead {
            info!("stopping q2ded...");
            if let Some(stdin) = session.proc.stdin.as_mut() {
                let _ = stdin.write_all(b"quit\r\n");
                let _ = stdin.flush();
            }
            drop(session.proc.stdin.take());
            session.proc.wait().context("failed to wait for q2ded")?;
        }
        self.registry.untrack(pid);
        transition(&mut self.state, MatchState::Idle);
        info!("\tq2ded is stopped");
        Ok(())
    }

    fn clear_console(&self) -> anyhow::Result<()> {
        let path = self.console_path();
        if path.exists() {
            debug!("removing existing console log");
            std::fs::remove_file(&path)
                .with_context(|| format!("could not remove {path:?}"))?;
        }
        File::create(&path).with_context(|| format!("could not create {path:?}"))?;
        Ok(())
    }
}
