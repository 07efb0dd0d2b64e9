//! Running the command behind a virtual file
//!
//! Each run spawns `/bin/sh -c <out_script>` with empty stdin and captures
//! stdout. A nonzero exit status still yields the captured stdout; only a
//! failure to start or collect the process is an error. There is no timeout
//! unless one is configured.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::config::ConfigEntry;

/// Configuration for the script runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Shell used to interpret `out_script`
    pub shell: PathBuf,
    /// Default working directory (the base directory)
    pub base_dir: PathBuf,
    /// Exported to scripts as `ROOT` (the mountpoint)
    pub root: Option<PathBuf>,
    /// Kill the script and fail the read after this long. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl RunnerConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            base_dir: base_dir.into(),
            root: None,
            timeout: None,
        }
    }
}

/// Captured result of one script run
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    pub stdout: Vec<u8>,
    pub status: ExitStatus,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error("failed to spawn script for {filename}: {source}")]
    Spawn {
        filename: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("failed to collect output of script for {filename}: {source}")]
    Wait {
        filename: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("script for {filename} did not finish within {timeout:?}")]
    TimedOut { filename: String, timeout: Duration },
    #[error("failed to start script runtime: {0}")]
    Runtime(#[source] Arc<std::io::Error>),
}

/// Executes configured commands
pub struct ScriptRunner {
    config: RunnerConfig,
    runtime: tokio::runtime::Runtime,
}

impl ScriptRunner {
    pub fn new(config: RunnerConfig) -> Result<Self, ScriptError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("scriptfs-runner")
            .enable_all()
            .build()
            .map_err(|e| ScriptError::Runtime(Arc::new(e)))?;
        Ok(Self { config, runtime })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run the entry's command and capture its stdout
    pub fn run(&self, entry: &ConfigEntry) -> Result<ScriptOutput, ScriptError> {
        self.run_with(entry, |_| {})
    }

    /// Like `run`, calling `on_spawn` with the child's pid once it started.
    pub fn run_with<F>(&self, entry: &ConfigEntry, on_spawn: F) -> Result<ScriptOutput, ScriptError>
    where
        F: FnOnce(u32),
    {
        let filename = entry.key().display().to_string();
        let mut command = self.command(entry);
        let timeout = self.config.timeout;

        tracing::debug!("Running script for {}: {}", filename, entry.script);

        let output = self.runtime.block_on(async {
            let child = command.spawn().map_err(|e| ScriptError::Spawn {
                filename: filename.clone(),
                source: Arc::new(e),
            })?;
            if let Some(pid) = child.id() {
                on_spawn(pid);
            }

            // Dropping the child on timeout kills it (kill_on_drop)
            let collected = match timeout {
                Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                    .await
                    .map_err(|_| ScriptError::TimedOut {
                        filename: filename.clone(),
                        timeout: limit,
                    })?,
                None => child.wait_with_output().await,
            };
            collected.map_err(|e| ScriptError::Wait {
                filename: filename.clone(),
                source: Arc::new(e),
            })
        })?;

        if !output.stderr.is_empty() {
            tracing::debug!(
                "Script for {} wrote to stderr: {}",
                filename,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }
        if !output.status.success() {
            tracing::warn!("Script for {} exited with {}", filename, output.status);
        }

        Ok(ScriptOutput {
            stdout: output.stdout,
            status: output.status,
        })
    }

    fn command(&self, entry: &ConfigEntry) -> Command {
        // Relative to the directory whose config file defines the entry
        let config_dir = self.config.base_dir.join(&entry.dir);
        let workdir = match &entry.workdir {
            Some(dir) => config_dir.join(dir),
            None => config_dir,
        };

        let mut command = Command::new(&self.config.shell);
        command
            .arg("-c")
            .arg(&entry.script)
            .current_dir(workdir)
            .envs(&entry.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(root) = &self.config.root {
            command.env("ROOT", root);
        }
        command
    }
}

impl std::fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner(dir: &TempDir) -> ScriptRunner {
        ScriptRunner::new(RunnerConfig::new(dir.path())).unwrap()
    }

    #[test]
    fn test_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let output = runner(&dir)
            .run(&ConfigEntry::new("hello", "echo hello; echo oops >&2"))
            .unwrap();

        assert_eq!(output.stdout, b"hello\n");
        assert!(output.status.success());
    }

    #[test]
    fn test_nonzero_exit_still_returns_stdout() {
        let dir = TempDir::new().unwrap();
        let output = runner(&dir)
            .run(&ConfigEntry::new("failing", "printf partial; exit 3"))
            .unwrap();

        assert_eq!(output.stdout, b"partial");
        assert_eq!(output.status.code(), Some(3));
    }

    #[test]
    fn test_runs_in_base_dir_by_default() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker"), "here").unwrap();

        let output = runner(&dir)
            .run(&ConfigEntry::new("cat", "cat marker"))
            .unwrap();
        assert_eq!(output.stdout, b"here");
    }

    #[test]
    fn test_relative_workdir_and_env() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/inner"), "inside").unwrap();

        let mut entry = ConfigEntry::new("x", "cat inner; printf \" $GREETING\"");
        entry.workdir = Some(PathBuf::from("sub"));
        entry.env.insert("GREETING".to_string(), "hi".to_string());

        let output = runner(&dir).run(&entry).unwrap();
        assert_eq!(output.stdout, b"inside hi");
    }

    #[test]
    fn test_nested_entry_runs_in_its_config_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        std::fs::write(dir.path().join("sub/marker"), "sub").unwrap();
        std::fs::write(dir.path().join("sub/deeper/marker"), "deeper").unwrap();

        let mut entry = ConfigEntry::new("x", "cat marker");
        entry.dir = PathBuf::from("sub");
        assert_eq!(runner(&dir).run(&entry).unwrap().stdout, b"sub");

        entry.workdir = Some(PathBuf::from("deeper"));
        assert_eq!(runner(&dir).run(&entry).unwrap().stdout, b"deeper");
    }

    #[test]
    fn test_root_is_exported() {
        let dir = TempDir::new().unwrap();
        let mut config = RunnerConfig::new(dir.path());
        config.root = Some(PathBuf::from("/mnt/scripts"));

        let output = ScriptRunner::new(config)
            .unwrap()
            .run(&ConfigEntry::new("root", "printf \"$ROOT\""))
            .unwrap();
        assert_eq!(output.stdout, b"/mnt/scripts");
    }

    #[test]
    fn test_missing_shell_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let mut config = RunnerConfig::new(dir.path());
        config.shell = PathBuf::from("/nonexistent/shell");

        let err = ScriptRunner::new(config)
            .unwrap()
            .run(&ConfigEntry::new("x", "true"))
            .unwrap_err();
        assert!(matches!(err, ScriptError::Spawn { .. }));
    }

    #[test]
    fn test_timeout_kills_script() {
        let dir = TempDir::new().unwrap();
        let mut config = RunnerConfig::new(dir.path());
        config.timeout = Some(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = ScriptRunner::new(config)
            .unwrap()
            .run(&ConfigEntry::new("slow", "sleep 5"))
            .unwrap_err();

        assert!(matches!(err, ScriptError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_no_timeout_by_default() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        assert!(runner.config().timeout.is_none());

        let output = runner
            .run(&ConfigEntry::new("slowish", "sleep 1; printf done"))
            .unwrap();
        assert_eq!(output.stdout, b"done");
    }

    #[test]
    fn test_on_spawn_reports_pid() {
        let dir = TempDir::new().unwrap();
        let mut seen = None;
        runner(&dir)
            .run_with(&ConfigEntry::new("pid", "true"), |pid| seen = Some(pid))
            .unwrap();
        assert!(seen.is_some_and(|pid| pid > 0));
    }
}
