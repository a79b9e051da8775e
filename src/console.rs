//! Tailing dispatcher for the game server's console log.
//!
//! The dedicated server narrates everything that happens in-game as plain
//! text appended to `qconsole.log`. A [`ConsolePoller`] tails that file on
//! a fixed interval, classifies each new line against an ordered template
//! table (first match wins, so specific shapes precede general ones), and
//! applies the typed event to the current roster: frags and suicides
//! mutate bot stats, the server-initialized separator fires a one-shot
//! ready signal, and everything else passes through as diagnostics.
//!
//! A parse failure or unknown participant never stops the stream; the
//! poll loop only ends when explicitly stopped, and stopping waits for the
//! in-flight cycle so the log file can be safely recreated afterwards.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, LazyLock, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::bot::Bot;

/// Interval between two console poll cycles.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Who is currently in the match, by in-game name.
pub(crate) type Roster = Arc<Mutex<HashMap<String, Arc<Bot>>>>;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Frag,
    Suicide,
    ServerInitialized,
}

struct MessageTemplate {
    pattern: Regex,
    kind: Kind,
}

fn template(kind: Kind, pattern: &str) -> MessageTemplate {
    MessageTemplate {
        pattern: Regex::new(&format!("^{pattern}$")).expect("invalid message template"),
        kind,
    }
}

/// The known console message shapes, in matching order. Frag shapes come
/// first: "was melted by X's hyperblaster" must win over the bare
/// "melted" suicide.
static TEMPLATES: LazyLock<Vec<MessageTemplate>> = LazyLock::new(|| {
    use Kind::*;
    vec![
        // Frag messages: victim first, attacker second.
        template(Frag, "(?P<victim>[^ ]+) was blasted by (?P<attacker>[^ ]+)"),
        template(Frag, "(?P<victim>[^ ]+) was gunned down by (?P<attacker>[^ ]+)"),
        template(
            Frag,
            "(?P<victim>[^ ]+) was blown away by (?P<attacker>[^ ]+)'s super shotgun",
        ),
        template(Frag, "(?P<victim>[^ ]+) was machinegunnged by (?P<attacker>[^ ]+)"),
        template(
            Frag,
            "(?P<victim>[^ ]+) was cut in half by (?P<attacker>[^ ]+)'s chaingun",
        ),
        template(Frag, "(?P<victim>[^ ]+) was popped by (?P<attacker>[^ ]+)'s grenade"),
        template(Frag, "(?P<victim>[^ ]+) ate (?P<attacker>[^ ]+)'s rocket"),
        template(Frag, "(?P<victim>[^ ]+) almost dodged (?P<attacker>[^ ]+)'s rocket"),
        template(
            Frag,
            "(?P<victim>[^ ]+) was melted by (?P<attacker>[^ ]+)'s hyperblaster",
        ),
        template(Frag, "(?P<victim>[^ ]+) was railed by (?P<attacker>[^ ]+)"),
        template(
            Frag,
            "(?P<victim>[^ ]+) saw the pretty lights from (?P<attacker>[^ ]+)'s BFG",
        ),
        template(
            Frag,
            "(?P<victim>[^ ]+) was disintegrated by (?P<attacker>[^ ]+)'s BFG blast",
        ),
        template(
            Frag,
            "(?P<victim>[^ ]+) couldn't hide from (?P<attacker>[^ ]+)'s BFG",
        ),
        template(Frag, "(?P<victim>[^ ]+) caught (?P<attacker>[^ ]+)'s handgrenade"),
        template(Frag, "(?P<victim>[^ ]+) didn't see (?P<attacker>[^ ]+)'s handgrenade"),
        template(Frag, "(?P<victim>[^ ]+) feels (?P<attacker>[^ ]+)'s pain"),
        template(
            Frag,
            "(?P<victim>[^ ]+) tried to invade (?P<attacker>[^ ]+)'s personal space",
        ),
        // Suicide messages.
        template(Suicide, "(?P<victim>[^ ]+) suicides"),
        template(Suicide, "(?P<victim>[^ ]+) cratered"),
        template(Suicide, "(?P<victim>[^ ]+) was squished"),
        template(Suicide, "(?P<victim>[^ ]+) sank like a rock"),
        template(Suicide, "(?P<victim>[^ ]+) melted"),
        template(Suicide, "(?P<victim>[^ ]+) does a back flip into the lava"),
        template(Suicide, "(?P<victim>[^ ]+) blew up"),
        template(Suicide, "(?P<victim>[^ ]+) found a way out"),
        template(Suicide, "(?P<victim>[^ ]+) saw the light"),
        template(Suicide, "(?P<victim>[^ ]+) was in the wrong place"),
        template(Suicide, "(?P<victim>[^ ]+) tried to put the pin back in"),
        template(Suicide, "(?P<victim>[^ ]+) tripped on (?:its|her|his) own grenade"),
        template(Suicide, "(?P<victim>[^ ]+) blew (?:itself|herself|himself) up"),
        template(Suicide, "(?P<victim>[^ ]+) should have used a smaller gun"),
        template(Suicide, "(?P<victim>[^ ]+) killed (?:itself|herself|himself)"),
        // Server lifecycle separators.
        template(ServerInitialized, "-------- Server Initialized ---------"),
        template(ServerInitialized, "-------------------------------------"),
    ]
});

/// A console line classified against the template table.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConsoleEvent {
    /// `victim` died at the hands of `attacker`.
    Frag { victim: String, attacker: String },
    /// `victim` killed themselves.
    Suicide { victim: String },
    /// The dedicated server finished initializing.
    ServerInitialized,
}

/// Match `line` (without its newline) against the templates in order.
pub(crate) fn classify(line: &str) -> Option<ConsoleEvent> {
    for template in TEMPLATES.iter() {
        let Some(captures) = template.pattern.captures(line) else {
            continue;
        };
        let event = match template.kind {
            Kind::Frag => ConsoleEvent::Frag {
                victim: captures["victim"].to_string(),
                attacker: captures["attacker"].to_string(),
            },
            Kind::Suicide => ConsoleEvent::Suicide {
                victim: captures["victim"].to_string(),
            },
            Kind::ServerInitialized => ConsoleEvent::ServerInitialized,
        };
        return Some(event);
    }
    None
}

/// Apply one console line to the roster. Returns the narration for scoring
/// events; `None` means the line was a diagnostic, a lifecycle signal, or
/// referenced someone not in the roster (logged and dropped).
pub(crate) fn apply_line(line: &str, roster: &Roster, ready: &SyncSender<()>) -> Option<String> {
    let event = classify(line.trim_end_matches(['\r', '\n']))?;
    match event {
        ConsoleEvent::Frag { victim, attacker } => {
            let roster = roster.lock().expect("poisoned");
            match (roster.get(&victim), roster.get(&attacker)) {
                (Some(target), Some(shooter)) => {
                    target.stats.lock().expect("poisoned").deaths += 1;
                    shooter.stats.lock().expect("poisoned").frags += 1;
                    Some(format!("{} killed {}.", shooter.name, target.name))
                }
                _ => {
                    warn!("unknown attacker or target: {attacker}/{victim}");
                    None
                }
            }
        }
        ConsoleEvent::Suicide { victim } => {
            let roster = roster.lock().expect("poisoned");
            match roster.get(&victim) {
                Some(target) => {
                    target.stats.lock().expect("poisoned").suicides += 1;
                    Some(format!("{} died.", target.name))
                }
                None => {
                    warn!("unknown suicide: {victim}");
                    None
                }
            }
        }
        ConsoleEvent::ServerInitialized => {
            // One-shot: a full slot means the launch already saw it, and a
            // later separator line must never block the poller.
            let _ = ready.try_send(());
            None
        }
    }
}

/// Read every complete line appended since `offset`, advancing `offset`
/// only past `\n`-terminated lines so a partially flushed line is re-read
/// whole on the next cycle.
pub(crate) fn read_new_lines(path: &Path, offset: &mut u64) -> anyhow::Result<Vec<String>> {
    let mut file =
        File::open(path).with_context(|| format!("could not open console log {path:?}"))?;
    file.seek(SeekFrom::Start(*offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut lines = Vec::new();
    let mut consumed = 0usize;
    while let Some(pos) = buf[consumed..].iter().position(|&b| b == b'\n') {
        let end = consumed + pos + 1;
        lines.push(String::from_utf8_lossy(&buf[consumed..end]).into_owned());
        consumed = end;
    }
    *offset += consumed as u64;
    Ok(lines)
}

/// Long-lived tailing task over the game server's console log.
#[derive(Debug)]
pub(crate) struct ConsolePoller {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ConsolePoller {
    /// Start tailing `path` from the beginning.
    pub(crate) fn start(
        path: PathBuf,
        roster: Roster,
        ready: SyncSender<()>,
    ) -> anyhow::Result<ConsolePoller> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("console-poller".to_string())
            .spawn(move || {
                let mut offset = 0u64;
                while !flag.load(Ordering::Relaxed) {
                    match read_new_lines(&path, &mut offset) {
                        Ok(lines) => {
                            for line in lines {
                                match apply_line(&line, &roster, &ready) {
                                    Some(narration) => info!("\t{narration}"),
                                    None => debug!("\t{}", line.trim_end()),
                                }
                            }
                        }
                        // Never let a bad cycle stop the stream.
                        Err(e) => debug!("console poll failed: {e:#}"),
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            })
            .context("could not spawn console poller thread")?;
        Ok(ConsolePoller {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop polling and wait for the in-flight cycle to finish.
    pub(crate) fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ConsolePoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::mpsc;

    fn roster_of(names: &[&str]) -> Roster {
        let map = names
            .iter()
            .map(|name| (name.to_string(), Arc::new(Bot::new(*name, ""))))
            .collect();
        Arc::new(Mutex::new(map))
    }

    fn stats_of(roster: &Roster, name: &str) -> crate::bot::Stats {
        roster.lock().unwrap()[name].stats()
    }

    #[test]
    fn classify_recognizes_frags_with_both_parties() {
        assert_eq!(
            classify("Nimbus was railed by Cortex"),
            Some(ConsoleEvent::Frag {
                victim: "Nimbus".to_string(),
                attacker: "Cortex".to_string(),
            })
        );
        assert_eq!(
            classify("Nimbus ate Cortex's rocket"),
            Some(ConsoleEvent::Frag {
                victim: "Nimbus".to_string(),
                attacker: "Cortex".to_string(),
            })
        );
    }

    #[test]
    fn classify_recognizes_suicides() {
        assert_eq!(
            classify("Nimbus suicides"),
            Some(ConsoleEvent::Suicide {
                victim: "Nimbus".to_string(),
            })
        );
        assert_eq!(
            classify("Nimbus tripped on its own grenade"),
            Some(ConsoleEvent::Suicide {
                victim: "Nimbus".to_string(),
            })
        );
    }

    #[test]
    fn frag_shapes_win_over_the_bare_melted_suicide() {
        assert_eq!(
            classify("Nimbus was melted by Cortex's hyperblaster"),
            Some(ConsoleEvent::Frag {
                victim: "Nimbus".to_string(),
                attacker: "Cortex".to_string(),
            })
        );
        assert_eq!(
            classify("Nimbus melted"),
            Some(ConsoleEvent::Suicide {
                victim: "Nimbus".to_string(),
            })
        );
    }

    #[test]
    fn classify_recognizes_server_initialized() {
        assert_eq!(
            classify("-------- Server Initialized ---------"),
            Some(ConsoleEvent::ServerInitialized)
        );
        assert_eq!(classify("ConsolePrint: loading map"), None);
    }

    #[test]
    fn frag_updates_both_parties_and_narrates() {
        let roster = roster_of(&["Nimbus", "Cortex"]);
        let (ready, _ready_rx) = mpsc::sync_channel(1);

        let narration = apply_line("Nimbus was railed by Cortex\n", &roster, &ready);
        assert_eq!(narration.as_deref(), Some("Cortex killed Nimbus."));
        assert_eq!(stats_of(&roster, "Nimbus").deaths, 1);
        assert_eq!(stats_of(&roster, "Nimbus").frags, 0);
        assert_eq!(stats_of(&roster, "Cortex").frags, 1);
        assert_eq!(stats_of(&roster, "Cortex").deaths, 0);
    }

    #[test]
    fn suicide_updates_only_the_victim() {
        let roster = roster_of(&["Nimbus", "Cortex"]);
        let (ready, _ready_rx) = mpsc::sync_channel(1);

        let narration = apply_line("Nimbus suicides\n", &roster, &ready);
        assert_eq!(narration.as_deref(), Some("Nimbus died."));
        assert_eq!(stats_of(&roster, "Nimbus").suicides, 1);
        assert_eq!(stats_of(&roster, "Cortex"), crate::bot::Stats::default());
    }

    #[test]
    fn unknown_participants_are_dropped_without_panicking() {
        let roster = roster_of(&["Cortex"]);
        let (ready, _ready_rx) = mpsc::sync_channel(1);

        assert_eq!(apply_line("Ghost was railed by Cortex\n", &roster, &ready), None);
        assert_eq!(apply_line("Ghost suicides\n", &roster, &ready), None);
        assert_eq!(stats_of(&roster, "Cortex"), crate::bot::Stats::default());
    }

    #[test]
    fn ready_signal_is_one_shot_and_never_blocks() {
        let roster = roster_of(&[]);
        let (ready, ready_rx) = mpsc::sync_channel(1);

        // Both separator shapes fire the signal; the second one finds the
        // slot full and is silently dropped.
        apply_line("-------- Server Initialized ---------\n", &roster, &ready);
        apply_line("-------------------------------------\n", &roster, &ready);
        assert!(ready_rx.try_recv().is_ok());
        assert!(ready_rx.try_recv().is_err());
    }

    #[test]
    fn tailing_processes_each_appended_line_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qconsole.log");
        std::fs::write(&path, "one\ntwo\n").unwrap();

        let mut offset = 0u64;
        assert_eq!(read_new_lines(&path, &mut offset).unwrap().len(), 2);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"three\nfour\nfive\n").unwrap();
        drop(file);

        let lines = read_new_lines(&path, &mut offset).unwrap();
        assert_eq!(lines, vec!["three\n", "four\n", "five\n"]);
        assert!(read_new_lines(&path, &mut offset).unwrap().is_empty());
    }

    #[test]
    fn partial_lines_are_left_for_the_next_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qconsole.log");
        std::fs::write(&path, "complete\npart").unwrap();

        let mut offset = 0u64;
        assert_eq!(read_new_lines(&path, &mut offset).unwrap(), vec!["complete\n"]);

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"ial\n").unwrap();
        drop(file);

        assert_eq!(read_new_lines(&path, &mut offset).unwrap(), vec!["partial\n"]);
    }

    #[test]
    fn poller_applies_lines_written_across_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qconsole.log");
        std::fs::write(&path, "").unwrap();

        let roster = roster_of(&["Nimbus", "Cortex"]);
        let (ready, ready_rx) = mpsc::sync_channel(1);
        let poller = ConsolePoller::start(path.clone(), roster.clone(), ready).unwrap();

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"-------- Server Initialized ---------\n").unwrap();
        file.write_all(b"Nimbus was railed by Cortex\n").unwrap();
        drop(file);

        assert!(ready_rx
            .recv_timeout(Duration::from_secs(5))
            .is_ok());
        // Give the poller one more cycle to pick up the frag line.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while stats_of(&roster, "Cortex").frags == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        poller.stop();

        assert_eq!(stats_of(&roster, "Cortex").frags, 1);
        assert_eq!(stats_of(&roster, "Nimbus").deaths, 1);
    }
}
