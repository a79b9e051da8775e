//! Compiling received bot sources into runnable executables.
//!
//! Each bot arrives as C++ source text and is linked against the botcore
//! library into `<workspace>/<name>/runbot`. A compile failure is an error
//! for that bot only: the harness logs it and the bot simply never gets an
//! executable, which excludes it from the match.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::bot::Bot;
use crate::configuration::Configuration;

/// Compiles bot sources with the configured C++ toolchain.
#[derive(Debug)]
pub struct Builder {
    gpp: PathBuf,
    workspace: PathBuf,
    include_paths: Vec<PathBuf>,
    lib_paths: Vec<PathBuf>,
    cflags: Vec<String>,
    ldflags: Vec<String>,
    libs: Vec<String>,
    src_files: Vec<PathBuf>,
}

impl Builder {
    /// Create a builder from the configured toolchain paths and flags.
    pub fn new(config: &Configuration) -> Builder {
        Builder {
            gpp: config.gpp.clone(),
            workspace: config.workspace.clone(),
            include_paths: vec![config.botcore.clone()],
            lib_paths: vec![config.botcore.clone()],
            cflags: config.cflags.clone(),
            ldflags: config.ldflags.clone(),
            libs: config.libs.clone(),
            src_files: config
                .botcore_sources
                .iter()
                .map(|src| config.botcore.join(src))
                .collect(),
        }
    }

    /// Write the bot's source to the workspace and compile it.
    ///
    /// On success the bot's `exe` and `src_file` paths are set. On failure
    /// they stay `None` and the error carries the first compiler message.
    pub fn compile(&self, bot: &mut Bot) -> anyhow::Result<()> {
        let bot_dir = self.workspace.join(&bot.name);
        fs::create_dir_all(&bot_dir)
            .with_context(|| format!("could not create {bot_dir:?}"))?;

        let code_path = bot_dir.join(format!("{}.cpp", bot.name));
        fs::write(&code_path, &bot.code)
            .with_context(|| format!("could not write {code_path:?}"))?;
        let output_path = bot_dir.join("runbot");

        let mut command = Command::new(&self.gpp);
        for include in &self.include_paths {
            command.arg(format!("-I{}", include.display()));
        }
        for lib_dir in &self.lib_paths {
            command.arg(format!("-L{}", lib_dir.display()));
        }
        command.args(&self.cflags);
        command.args(&self.ldflags);
        command.arg("-o").arg(&output_path);
        command.args(&self.src_files);
        command.arg(&code_path);
        // Libraries go last so ld picks them up.
        for lib in &self.libs {
            command.arg(format!("-l{lib}"));
        }

        debug!("{command:?}");
        let output = command
            .output()
            .with_context(|| format!("could not launch compiler {:?}", self.gpp))?;

        if output.status.success() {
            bot.src_file = Some(code_path);
            bot.exe = Some(output_path);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("failed to build {}", code_path.display());
        anyhow::bail!(
            "compilation error: {}",
            stderr.trim().lines().next().unwrap_or_default()
        )
    }

    /// Remove the generated source and executable. Best-effort.
    pub fn clean(&self, bot: &Bot) {
        info!("cleaning up {}", bot.name);
        if let Some(src_file) = &bot.src_file {
            let _ = fs::remove_file(src_file);
        }
        if let Some(exe) = &bot.exe {
            let _ = fs::remove_file(exe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_compilation_leaves_the_bot_without_an_executable() {
        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::new().with_toolchain(
            "definitely-not-a-compiler",
            dir.path().join("botcore"),
            dir.path().join("workspace"),
        );
        let builder = Builder::new(&config);

        let mut bot = Bot::new("broken", "int main( {");
        assert!(builder.compile(&mut bot).is_err());
        assert!(bot.exe.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn successful_compilation_sets_the_paths() {
        // A tiny sh shim stands in for g++: it only honors `-o <out>`.
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let shim = dir.path().join("fakecc");
        std::fs::write(&shim, "#!/bin/sh\nout=\"\"\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then out=\"$2\"; shift; fi\n  shift\ndone\n: > \"$out\"\n").unwrap();
        std::fs::set_permissions(&shim, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = Configuration::new().with_toolchain(
            &shim,
            dir.path().join("botcore"),
            dir.path().join("workspace"),
        );
        let builder = Builder::new(&config);

        let mut bot = Bot::new("works", "int main() { return 0; }");
        builder.compile(&mut bot).unwrap();
        assert!(bot.exe.as_ref().unwrap().ends_with("works/runbot"));
        assert!(bot.exe.as_ref().unwrap().exists());

        builder.clean(&bot);
        assert!(!bot.exe.as_ref().unwrap().exists());
    }
}
