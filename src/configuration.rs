//! Configuration for the evaluation harness.
//!
//! A [`Configuration`] collects every path and knob the harness needs:
//! where the dedicated server and its game data live, which port bots
//! connect to, where the GP server is reached, and how bot sources are
//! compiled. Values can be set programmatically with the `with_*` methods
//! or pulled from environment variables with
//! [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional; unset variables keep their defaults.
//!
//! - `ARENA_Q2DED`: path to the dedicated server binary
//! - `ARENA_BASEQ2`: path to the game data directory (holds `qconsole.log`)
//! - `ARENA_GAME_PORT`: UDP port bots connect to (default: `27910`)
//! - `ARENA_GP_HOST` / `ARENA_GP_PORT`: the GP server (defaults:
//!   `localhost:9716`)
//! - `ARENA_GPP`: path to the C++ compiler (default: `g++`)
//! - `ARENA_BOTCORE`: path to the botcore sources and libraries
//! - `ARENA_WORKSPACE`: scratch directory for generated bot sources and
//!   executables (default: `workspace`)
//! - `ARENA_MAP`: map to run matches on (default: `tsm_dm1`)
//! - `ARENA_LOG`: `"true"` enables logging to a file (default: `false`)

use std::path::PathBuf;
use std::time::Duration;

/// Paths, ports and flags for the harness.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) q2ded: PathBuf,
    pub(crate) baseq2: PathBuf,
    pub(crate) game_port: u16,
    pub(crate) gp_host: String,
    pub(crate) gp_port: u16,
    pub(crate) gpp: PathBuf,
    pub(crate) botcore: PathBuf,
    pub(crate) workspace: PathBuf,
    pub(crate) cflags: Vec<String>,
    pub(crate) ldflags: Vec<String>,
    pub(crate) libs: Vec<String>,
    pub(crate) botcore_sources: Vec<String>,
    pub(crate) map: String,
    pub(crate) time_limit: Duration,
    pub(crate) log: bool,
}

impl Configuration {
    /// Create a configuration with default parameters.
    ///
    /// By default the server binary and botcore are expected next to the
    /// harness, matches run for two minutes on `tsm_dm1`, the GP server is
    /// looked for on `localhost:9716`, and file logging is disabled.
    pub fn new() -> Self {
        Self {
            q2ded: PathBuf::from("q2ded"),
            baseq2: PathBuf::from("baseq2"),
            game_port: 27910,
            gp_host: "localhost".to_string(),
            gp_port: 9716,
            gpp: PathBuf::from("g++"),
            botcore: PathBuf::from("q2botcore"),
            workspace: PathBuf::from("workspace"),
            cflags: vec![],
            ldflags: vec![],
            libs: vec![],
            botcore_sources: vec![],
            map: "tsm_dm1".to_string(),
            time_limit: Duration::from_secs(120),
            log: false,
        }
    }

    /// Create a configuration from environment variables (see module
    /// docs). Any unset or unparsable variable keeps its default.
    pub fn from_env() -> Self {
        fn get_path(var: &str, default: PathBuf) -> PathBuf {
            std::env::var_os(var).map(PathBuf::from).unwrap_or(default)
        }
        fn get_string(var: &str, default: &str) -> String {
            std::env::var(var).unwrap_or_else(|_| default.to_string())
        }
        fn get_port(var: &str, default: u16) -> u16 {
            std::env::var(var)
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(default)
        }
        fn get_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(value) => value.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        let defaults = Self::new();
        Self {
            q2ded: get_path("ARENA_Q2DED", defaults.q2ded),
            baseq2: get_path("ARENA_BASEQ2", defaults.baseq2),
            game_port: get_port("ARENA_GAME_PORT", defaults.game_port),
            gp_host: get_string("ARENA_GP_HOST", &defaults.gp_host),
            gp_port: get_port("ARENA_GP_PORT", defaults.gp_port),
            gpp: get_path("ARENA_GPP", defaults.gpp),
            botcore: get_path("ARENA_BOTCORE", defaults.botcore),
            workspace: get_path("ARENA_WORKSPACE", defaults.workspace),
            map: get_string("ARENA_MAP", &defaults.map),
            log: get_flag("ARENA_LOG", defaults.log),
            ..defaults
        }
    }

    /// Path to the dedicated server binary.
    pub fn with_q2ded(mut self, path: impl Into<PathBuf>) -> Self {
        self.q2ded = path.into();
        self
    }

    /// Path to the game data directory holding `qconsole.log`.
    pub fn with_baseq2(mut self, path: impl Into<PathBuf>) -> Self {
        self.baseq2 = path.into();
        self
    }

    /// UDP port bots are told to connect to.
    pub fn with_game_port(mut self, port: u16) -> Self {
        self.game_port = port;
        self
    }

    /// Host and port of the GP server providing bots and taking results.
    pub fn with_gp_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.gp_host = host.into();
        self.gp_port = port;
        self
    }

    /// C++ compiler, botcore directory and scratch workspace for builds.
    pub fn with_toolchain(
        mut self,
        gpp: impl Into<PathBuf>,
        botcore: impl Into<PathBuf>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        self.gpp = gpp.into();
        self.botcore = botcore.into();
        self.workspace = workspace.into();
        self
    }

    /// Extra compiler and linker flags for bot builds.
    pub fn with_build_flags(mut self, cflags: Vec<String>, ldflags: Vec<String>) -> Self {
        self.cflags = cflags;
        self.ldflags = ldflags;
        self
    }

    /// Libraries linked into every bot (passed as `-l<name>`, last).
    pub fn with_libs(mut self, libs: Vec<String>) -> Self {
        self.libs = libs;
        self
    }

    /// Botcore source files compiled into every bot, relative to the
    /// botcore directory.
    pub fn with_botcore_sources(mut self, sources: Vec<String>) -> Self {
        self.botcore_sources = sources;
        self
    }

    /// Map matches are played on.
    pub fn with_map(mut self, map: impl Into<String>) -> Self {
        self.map = map.into();
        self
    }

    /// Wall-clock duration of one match.
    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    /// Enable or disable logging to a file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
