//! End-to-end tests for the bot RPC channel, using small shell scripts as
//! stand-in bot executables.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, Layer, Registry};

use botarena::bot::Bot;
use botarena::bot_channel::{BotChannel, RpcError};
use botarena::registry::ProcessRegistry;

#[allow(dead_code)]
fn init_debug_logger() {
    let format = fmt::format()
        .without_time()
        .with_ansi(true)
        .with_thread_names(true)
        .with_target(false);

    let reg = Registry::default().with(
        fmt::layer()
            .event_format(format)
            .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                Level::TRACE,
            )),
    );

    let _ = tracing::subscriber::set_global_default(reg);
}

/// Write an executable shell script and wrap it in a launchable [`Bot`].
fn script_bot(dir: &TempDir, name: &str, body: &str) -> Bot {
    let path = dir.path().join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    let mut bot = Bot::new(name, "");
    bot.exe = Some(path);
    bot
}

const ECHO_BOT: &str = "#!/bin/sh\nwhile read line; do echo \"return $line\"; done\n";

#[test]
fn calls_complete_in_order() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ProcessRegistry::new());
    let bot = script_bot(&dir, "echoer", ECHO_BOT);

    let channel = BotChannel::launch(&bot, &registry).unwrap();
    assert_eq!(channel.name(), "echoer");

    assert_eq!(channel.call("alpha", &[]).unwrap(), "alpha");
    assert_eq!(channel.call("beta", &["1"]).unwrap(), "beta 1");
    assert_eq!(channel.call("gamma", &["x", "y"]).unwrap(), "gamma x y");
}

#[test]
fn command_wrappers_send_expected_lines() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ProcessRegistry::new());
    let bot = script_bot(&dir, "wrapped", ECHO_BOT);

    let channel = BotChannel::launch(&bot, &registry).unwrap();

    assert_eq!(
        channel.connect("localhost", 27910).unwrap(),
        "connect localhost 27910"
    );
    assert_eq!(channel.start().unwrap(), "start");
    assert_eq!(channel.stop().unwrap(), "stop");
    assert_eq!(channel.disconnect().unwrap(), "disconnect");
    assert_eq!(channel.quit().unwrap(), "quit");
}

#[test]
fn timeout_leaves_the_channel_usable() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ProcessRegistry::new());
    // Reads commands forever but never answers.
    let bot = script_bot(&dir, "mute", "#!/bin/sh\nwhile read line; do :; done\n");

    let channel =
        BotChannel::launch_with_timeout(&bot, &registry, Duration::from_millis(300)).unwrap();

    // A mute bot must not wedge the marshal thread: both calls time out
    // instead of the second one failing on a dead channel.
    assert_eq!(channel.call("start", &[]), Err(RpcError::Timeout));
    assert_eq!(channel.call("stop", &[]), Err(RpcError::Timeout));
}

#[test]
fn malformed_reply_is_a_desync() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(ProcessRegistry::new());
    let bot = script_bot(
        &dir,
        "babbler",
        "#!/bin/sh\nwhile read line; do echo \"nonsense\"; done\n",
    );

    let channel = BotChannel::launch(&bot, &registry).unwrap();

    match channel.call("start", &[]) {
        Err(RpcError::ProtocolDesync(line)) => assert_eq!(line, "nonsense"),
        other => panic!("expected a desync, got {other:?}"),
    }

    // The marshal thread bails on a desync and kills the bot, so further
    // calls find the channel closed.
    assert_eq!(channel.call("stop", &[]), Err(RpcError::ChannelClosed));
}

#[test]
fn launch_requires_an_executable() {
    let registry = Arc::new(ProcessRegistry::new());
    let bot = Bot::new("uncompiled", "(progn)");

    let err = BotChannel::launch(&bot, &registry).unwrap_err();
    assert!(err.to_string().contains("no compiled executable"));
}
