//! Per-bot request/response marshaling over a [`Channel`].
//!
//! A [`BotChannel`] turns "write a command line, read one response line"
//! into a blocking [`call`](BotChannel::call) with a strict
//! one-command-in-flight contract and a bounded wait. Construction spawns
//! the bot's executable and a dedicated marshal thread; single-slot queues
//! in both directions enforce the ordering.
//!
//! Wire format: request `"<command> <arg> <arg> ...\n"`, response
//! `"return <value>\n"`. Anything else is a protocol desync, fatal to the
//! marshal thread, which then kills the process through the registry so a
//! desync can never leave an orphan behind.

use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::bot::Bot;
use crate::channel::{Channel, Recv, SendOutcome};
use crate::registry::ProcessRegistry;

/// How long a call waits for the bot's response line.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the marshal loop waits for a pending command before checking
/// whether the bot process has exited.
const COMMAND_POLL: Duration = Duration::from_secs(1);

/// How long a single command line may stay partially written.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why an RPC call failed. Callers must decide whether the bot is still
/// usable; only [`Timeout`](RpcError::Timeout) leaves the marshal loop
/// alive.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// No response line arrived within the allotted window. The marshal
    /// loop keeps running; a later reply may go stale (see module docs).
    #[error("no response from the bot within the allotted time")]
    Timeout,
    /// The response line did not have the `return <value>` shape. The
    /// marshal loop has killed the bot process.
    #[error("malformed response line: {0:?}")]
    ProtocolDesync(String),
    /// The marshal loop is gone (process exited or worker failed).
    #[error("the bot's marshal channel is gone")]
    ChannelClosed,
}

/// Serialized RPC channel to one running bot process.
#[derive(Debug)]
pub struct BotChannel {
    name: String,
    pid: u32,
    timeout: Duration,
    commands: SyncSender<String>,
    replies: Receiver<Result<String, RpcError>>,
}

impl BotChannel {
    /// Spawn the bot's executable and its marshal thread, then block until
    /// the thread signals readiness.
    pub fn launch(bot: &Bot, registry: &Arc<ProcessRegistry>) -> anyhow::Result<BotChannel> {
        Self::launch_with_timeout(bot, registry, RPC_TIMEOUT)
    }

    /// [`launch`](BotChannel::launch) with a custom response timeout.
    pub fn launch_with_timeout(
        bot: &Bot,
        registry: &Arc<ProcessRegistry>,
        timeout: Duration,
    ) -> anyhow::Result<BotChannel> {
        let exe = bot
            .exe
            .clone()
            .with_context(|| format!("bot {} has no compiled executable", bot.name))?;

        let mut command = Command::new(&exe);
        command
            .arg(&bot.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        if let Some(dir) = exe.parent().filter(|p| !p.as_os_str().is_empty()) {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("could not spawn bot {} ({})", bot.name, exe.display()))?;
        let pid = child.id();
        let channel = match Channel::new(&mut child, registry.clone(), &bot.name) {
            Ok(channel) => channel,
            Err(e) => {
                let _ = child.kill();
                return Err(e);
            }
        };
        debug!("launched bot {} with pid = {pid}", bot.name);

        let (command_tx, command_rx) = mpsc::sync_channel(1);
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);

        let name = bot.name.clone();
        let worker_registry = registry.clone();
        thread::Builder::new()
            .name(format!("{}:marshal", bot.name))
            .spawn(move || {
                marshal_loop(
                    &name,
                    child,
                    channel,
                    &command_rx,
                    &reply_tx,
                    &worker_registry,
                    timeout,
                )
            })
            .context("could not spawn marshal thread")?;

        let bot_channel = BotChannel {
            name: bot.name.clone(),
            pid,
            timeout,
            commands: command_tx,
            replies: reply_rx,
        };

        // Wait for the marshal thread's ready notification before
        // accepting calls.
        debug!("waiting for {}'s marshal thread to become ready", bot.name);
        bot_channel
            .replies
            .recv()
            .map_err(|_| anyhow::anyhow!("marshal thread exited before becoming ready"))??;
        Ok(bot_channel)
    }

    /// Name of the bot this channel belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pid of the bot process.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Issue `<command> <args...>` and wait for its `return` value.
    ///
    /// At most one call is in flight per bot; a second call issued while
    /// the first is pending blocks on the single-slot command queue until
    /// the marshal thread accepts it.
    pub fn call(&self, command: &str, args: &[&str]) -> Result<String, RpcError> {
        let mut line = command.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.commands
            .send(line)
            .map_err(|_| RpcError::ChannelClosed)?;
        match self.replies.recv_timeout(self.timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                debug!("{}: command timed out", self.name);
                Err(RpcError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(RpcError::ChannelClosed),
        }
    }

    /// Connect the bot to the game server.
    pub fn connect(&self, host: &str, port: u16) -> Result<String, RpcError> {
        self.call("connect", &[host, &port.to_string()])
    }

    /// Let the bot start fighting.
    pub fn start(&self) -> Result<String, RpcError> {
        self.call("start", &[])
    }

    /// Freeze the bot's activity (issued to everyone before teardown).
    pub fn stop(&self) -> Result<String, RpcError> {
        self.call("stop", &[])
    }

    /// Disconnect the bot from the game server.
    pub fn disconnect(&self) -> Result<String, RpcError> {
        self.call("disconnect", &[])
    }

    /// Ask the bot process to exit.
    pub fn quit(&self) -> Result<String, RpcError> {
        self.call("quit", &[])
    }
}

fn marshal_loop(
    name: &str,
    mut child: Child,
    mut channel: Channel,
    commands: &Receiver<String>,
    replies: &SyncSender<Result<String, RpcError>>,
    registry: &ProcessRegistry,
    timeout: Duration,
) {
    // Ready handshake: unblocks BotChannel::launch.
    let _ = replies.send(Ok(String::from("ready")));

    let mut pending = Vec::new();
    let outcome = run_marshal(
        name,
        &mut child,
        &mut channel,
        commands,
        replies,
        timeout,
        &mut pending,
    );

    if let Err(e) = outcome {
        // A desync or I/O failure must never leave an orphaned process.
        error!("{name}: marshal loop failed: {e:#}");
        registry.kill(channel.pid());
    }
    let _ = child.wait();
    channel.close();
    debug!("{name}: marshal loop is done");
}

fn run_marshal(
    name: &str,
    child: &mut Child,
    channel: &mut Channel,
    commands: &Receiver<String>,
    replies: &SyncSender<Result<String, RpcError>>,
    timeout: Duration,
    pending: &mut Vec<u8>,
) -> anyhow::Result<()> {
    loop {
        if child
            .try_wait()
            .context("could not poll bot process")?
            .is_some()
        {
            return Ok(());
        }

        let command = match commands.recv_timeout(COMMAND_POLL) {
            Ok(command) => command,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                // The channel owner is gone; a quit command is usually in
                // flight, so give the bot a moment to exit on its own.
                for _ in 0..50 {
                    if child.try_wait()?.is_some() {
                        return Ok(());
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                anyhow::bail!("channel owner is gone but the bot did not exit");
            }
        };

        debug!("{name} << {command}");
        write_line(channel, &command)?;

        let Some(line) = read_line(channel, pending, timeout)? else {
            // The caller has already given up with a timeout. Stay alive:
            // the bot may still answer, and the reply will sit in the
            // buffer (stale-reply hazard, see module docs).
            warn!("{name}: no response within {timeout:?}");
            continue;
        };

        match parse_return(&line) {
            Some(value) => {
                debug!("{name} >> {value}");
                if replies.try_send(Ok(value.to_string())).is_err() {
                    debug!("{name}: reply slot full, dropping stale value");
                }
            }
            None => {
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                let _ = replies.try_send(Err(RpcError::ProtocolDesync(line.clone())));
                anyhow::bail!("malformed response line: {line:?}");
            }
        }
    }
}

/// Write one command line, retrying briefly while the pipe is unwritable.
fn write_line(channel: &mut Channel, command: &str) -> anyhow::Result<()> {
    let line = format!("{command}\n");
    let bytes = line.as_bytes();
    let deadline = Instant::now() + WRITE_TIMEOUT;
    let mut written = 0;
    while written < bytes.len() {
        match channel.send(&bytes[written..])? {
            SendOutcome::Sent(0) => {
                if Instant::now() >= deadline {
                    anyhow::bail!("bot input pipe stayed unwritable");
                }
                thread::sleep(Duration::from_millis(10));
            }
            SendOutcome::Sent(n) => written += n,
            SendOutcome::Closed => anyhow::bail!("bot closed its input stream"),
        }
    }
    Ok(())
}

/// Accumulate bytes until a complete line is available or `timeout` runs
/// out. Leftover bytes past the newline stay in `pending` for the next
/// exchange.
fn read_line(
    channel: &mut Channel,
    pending: &mut Vec<u8>,
    timeout: Duration,
) -> anyhow::Result<Option<String>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        if !channel.wait_readable(Some(remaining))? {
            return Ok(None);
        }
        match channel.recv(Channel::DEFAULT_RECV_LIMIT)? {
            Recv::Data(bytes) => pending.extend_from_slice(&bytes),
            Recv::Empty => thread::sleep(Duration::from_millis(1)),
            Recv::Closed => anyhow::bail!("bot closed its output stream"),
        }
    }
}

/// Pull the value out of a `return <value>` response line.
fn parse_return(line: &str) -> Option<&str> {
    line.strip_prefix("return ")
        .map(|rest| rest.trim_end_matches(['\r', '\n']))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_return_extracts_the_value() {
        assert_eq!(parse_return("return ok\n"), Some("ok"));
        assert_eq!(parse_return("return 12 34\r\n"), Some("12 34"));
        assert_eq!(parse_return("return \n"), Some(""));
    }

    #[test]
    fn parse_return_rejects_other_shapes() {
        assert_eq!(parse_return("ok\n"), None);
        assert_eq!(parse_return("return\n"), None);
        assert_eq!(parse_return("returned ok\n"), None);
        assert_eq!(parse_return(""), None);
    }
}
