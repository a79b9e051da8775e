//! # Bot Arena
//!
//! An evaluation harness that scores evolved Quake 2 bots by making them
//! fight. It connects to an evolution server over TCP, receives a generation
//! of bot programs, compiles each one against the bot core, runs them all in
//! a deathmatch on a dedicated `q2ded` server, and reports every bot's
//! fitness back.
//!
//! It provides:
//! - The full evaluation loop (`Harness`)
//! - Dedicated game server control and console-log scoring (`GameServer`)
//! - A line-oriented RPC channel to each bot process (`BotChannel`)
//! - Non-blocking child stdio with timeouts (`Channel`)
//! - A process registry for emergency teardown (`ProcessRegistry`)
//!
//! Each bot runs as a separate OS process and is driven over its stdin and
//! stdout. Bot processes are never trusted: every exchange carries a
//! timeout, and any bot that stops answering is killed and excluded without
//! taking the match down.
//!
//! # Documentation Overview
//!
//! - For the match lifecycle (launch, admit, fight, wind down), see the
//!   [`server`] module.
//! - For the bot RPC protocol and its failure modes, see
//!   [`BotChannel`](crate::bot_channel::BotChannel) and
//!   [`RpcError`](crate::bot_channel::RpcError).
//! - For paths, ports and toolchain settings, see
//!   [`Configuration`](crate::configuration::Configuration).
//!
//! # Usage Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use botarena::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::new()
//!         .with_q2ded("/opt/quake2/q2ded")
//!         .with_baseq2("/opt/quake2/baseq2")
//!         .with_gp_server("evolver.local", 9716)
//!         .with_time_limit(Duration::from_secs(120))
//!         .with_log(true);
//!
//!     Harness::new(config).run()
//! }
//! ```
//!
//! # Bot Requirements
//!
//! A compiled bot is a standalone executable driven over stdin/stdout with a
//! basic line protocol:
//! - Harness -> bot: one command per line, e.g. `connect localhost 27910`
//! - Bot -> harness: one reply per line, `return <value>`
//!
//! Bots must answer every command within 30 seconds or they are killed.
#![warn(missing_docs)]

pub use anyhow;

pub mod bot;
pub mod bot_channel;
pub mod builder;
pub mod channel;
pub mod client;
pub mod configuration;
mod console;
mod logger;
pub mod registry;
pub mod server;

/// Commonly used types for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use botarena::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bot::{Bot, Stats};
    pub use crate::bot_channel::{BotChannel, RpcError};
    pub use crate::client::Harness;
    pub use crate::configuration::Configuration;
    pub use crate::registry::ProcessRegistry;
    pub use crate::server::GameServer;
}
