//! Top-level harness tying the evolution server to the game server.
//!
//! [`Harness::run`] loops forever: fetch a generation of bots from the
//! evolution server over TCP, compile them, run one match, and post the
//! resulting fitness values back. Any failure during a match discards its
//! results, tears every tracked process down and relaunches the game server
//! before the next generation.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{debug, error, info, warn};

use crate::bot::{Bot, Stats};
use crate::builder::Builder;
use crate::configuration::Configuration;
use crate::logger::init_logger;
use crate::registry::ProcessRegistry;
use crate::server::{dm_flags, GameServer};

/// Upper bound on bots admitted to one match, limited by player slots.
pub const MAX_BOTS: usize = 16;

/// Back-off before asking the evolution server for bots again after an
/// empty or failed fetch.
pub const SERVER_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Evaluation client: fetches bots, runs matches, reports fitness.
pub struct Harness {
    config: Configuration,
    builder: Builder,
    server: GameServer,
    registry: Arc<ProcessRegistry>,
    bots: Vec<Arc<Bot>>,
    running: bool,
}

impl Harness {
    /// Build a harness from `config`. Installs the file logger when
    /// `config.log` is set.
    pub fn new(config: Configuration) -> Harness {
        if config.log {
            init_logger();
        }

        let registry = Arc::new(ProcessRegistry::new());
        let builder = Builder::new(&config);
        let server = GameServer::new(&config, Arc::clone(&registry));

        Harness {
            config,
            builder,
            server,
            registry,
            bots: vec![],
            running: true,
        }
    }

    /// Request the next running generation to be the last one.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Main evaluation loop. Returns once [`Harness::stop`] has been called
    /// and the current generation finished, or if the game server cannot be
    /// (re)launched at all.
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.launch_server()
            .context("failed to launch the game server")?;

        let mut generation = 0u64;
        while self.running {
            info!("starting generation {generation}");

            let (token, mut bots) = match self.fetch_bots() {
                Ok(Some(fetched)) => fetched,
                Ok(None) => {
                    warn!(
                        "no bots received, retrying in {} s",
                        SERVER_RETRY_TIMEOUT.as_secs()
                    );
                    thread::sleep(SERVER_RETRY_TIMEOUT);
                    continue;
                }
                Err(e) => {
                    warn!(
                        "failed to fetch bots: {e:#}, retrying in {} s",
                        SERVER_RETRY_TIMEOUT.as_secs()
                    );
                    thread::sleep(SERVER_RETRY_TIMEOUT);
                    continue;
                }
            };

            self.compile_bots(&mut bots);
            self.bots = bots.into_iter().map(Arc::new).collect();

            match self.server.run_match(self.config.time_limit, &self.bots) {
                Ok(results) => {
                    if let Err(e) = self.post_results(&token, &results) {
                        warn!("failed to post results: {e:#}");
                    }
                    self.clean_up();
                    generation += 1;
                }
                Err(e) => {
                    error!("match failed, results discarded: {e:#}");
                    self.recover()
                        .context("failed to recover the game server")?;
                }
            }
        }

        self.server.kill()
    }

    fn launch_server(&mut self) -> anyhow::Result<()> {
        // Instant powerups keep bots out of inventory management, forced
        // respawn revives bots that never fire, and farthest spawn points
        // prevent telefrags.
        let dmflags =
            dm_flags::INSTANT_POWERUPS + dm_flags::FORCE_RESPAWN + dm_flags::SPAWN_FARTHEST;
        let options = [
            ("timelimit".to_string(), "0".to_string()),
            ("fraglimit".to_string(), "0".to_string()),
            // One extra slot for a spectator.
            ("maxclients".to_string(), (MAX_BOTS + 1).to_string()),
            ("dmflags".to_string(), dmflags.to_string()),
        ];
        self.server.launch(&options, &self.config.map)
    }

    /// Fetch the next generation from the evolution server.
    ///
    /// The protocol is line-based text: the client sends `GETBOTS`, the
    /// server answers with a result token followed by, per bot, a
    /// `STARTBOT <name>` line, the bot's program text, and an
    /// `ENDBOT <name>` terminator. Returns the token and the fetched bots,
    /// or `None` when the server has no bots ready.
    fn fetch_bots(&mut self) -> anyhow::Result<Option<(String, Vec<Bot>)>> {
        self.bots.clear();

        let host = self.config.gp_host.as_str();
        let port = self.config.gp_port;
        info!("connecting to {host}:{port}");
        let mut stream = TcpStream::connect((host, port))
            .with_context(|| format!("failed to connect to {host}:{port}"))?;

        debug!("GETBOTS");
        stream.write_all(b"GETBOTS\n")?;
        let mut input = BufReader::new(stream);

        let mut token = String::new();
        input.read_line(&mut token)?;
        let token = token.trim_end().to_string();
        if token.is_empty() {
            return Ok(None);
        }
        info!("received token {token}");

        let mut bots = vec![];
        let mut line = String::new();
        loop {
            line.clear();
            if input.read_line(&mut line)? == 0 {
                break;
            }
            let name = match line.trim_end().strip_prefix("STARTBOT ") {
                Some(name) => name.to_string(),
                None => bail!("expected STARTBOT, got {:?}", line.trim_end()),
            };
            let end = format!("ENDBOT {name}");

            let mut code = String::new();
            loop {
                line.clear();
                if input.read_line(&mut line)? == 0 {
                    bail!("stream ended inside bot {name}");
                }
                if line.trim_end() == end {
                    break;
                }
                code.push_str(&line);
            }

            info!("received bot {name}\t({} lines)", code.lines().count());
            bots.push(Bot::new(name, code));
        }

        if bots.len() > MAX_BOTS {
            warn!(
                "received {} bots, keeping the first {MAX_BOTS}",
                bots.len()
            );
            bots.truncate(MAX_BOTS);
        }
        Ok(Some((token, bots)))
    }

    /// Compile every fetched bot. A bot that fails to compile keeps a `None`
    /// executable and is excluded from the match; its fitness is still
    /// posted so broken programs score poorly instead of vanishing.
    fn compile_bots(&mut self, bots: &mut [Bot]) {
        info!("compiling:");
        for bot in bots {
            info!("\t{}", bot.name);
            if let Err(e) = self.builder.compile(bot) {
                warn!("\t{}: compilation failed: {e:#}", bot.name);
            }
        }
    }

    /// Send every bot's fitness back under `token`.
    fn post_results(&self, token: &str, results: &[(String, Stats)]) -> anyhow::Result<()> {
        let host = self.config.gp_host.as_str();
        let port = self.config.gp_port;
        info!("posting results to {host}:{port} with token {token}");

        let mut stream = TcpStream::connect((host, port))
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        stream.write_all(b"POSTRESULTS\n")?;
        stream.write_all(format!("{token}\n").as_bytes())?;

        // Every fetched bot gets a line, not only the admitted ones: bots
        // that failed to compile or launch report their zeroed stats.
        for bot in &self.bots {
            let stats = results
                .iter()
                .find(|(name, _)| *name == bot.name)
                .map(|(_, stats)| *stats)
                .unwrap_or_else(|| bot.stats());
            let fitness = stats.fitness();
            info!("\t{}:\tfitness = {fitness}", bot.name);
            stream.write_all(format!("{fitness:.6} {}\n", bot.name).as_bytes())?;
        }
        Ok(())
    }

    fn clean_up(&mut self) {
        for bot in &self.bots {
            self.builder.clean(bot);
        }
    }

    /// Tear everything down after a failed match and relaunch the game
    /// server, ready for the next generation.
    fn recover(&mut self) -> anyhow::Result<()> {
        self.registry.kill_all();
        if let Err(e) = self.server.kill() {
            warn!("game server teardown failed: {e:#}");
        }
        self.launch_server()
    }
}
