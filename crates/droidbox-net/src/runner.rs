//! Host command execution seam.
//!
//! Everything this crate does to the host (`ip`, `iptables`, `tc`, resolver
//! files, sysctls) funnels through [`CommandRunner`]. Production code uses
//! [`HostRunner`]; tests substitute a recording fake and assert on the exact
//! argument vectors instead of mutating kernel state.

use std::io;
use std::path::Path;
use std::process::Command;

/// Captured result of one host command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Whether the command exited successfully.
    pub success: bool,
    /// Decoded standard output.
    pub stdout: String,
    /// Decoded standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful output carrying `stdout`.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed output carrying `stderr`.
    #[must_use]
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Trait for host-side command and file I/O.
///
/// Methods take `&self`; implementations must be safe to share across the
/// concurrent provisioning and teardown paths.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, capturing output.
    ///
    /// A non-zero exit is reported through [`CommandOutput::success`], not as
    /// an `Err`; `Err` means the program could not be spawned at all.
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;

    /// Writes `contents` to `path`, creating parent directories as needed.
    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()>;

    /// Removes a file or directory tree, succeeding if it is already absent.
    fn remove_path(&self, path: &Path) -> io::Result<()>;
}

/// [`CommandRunner`] backed by real host processes and the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl HostRunner {
    /// Creates a new host runner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CommandRunner for HostRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)
    }

    fn remove_path(&self, path: &Path) -> io::Result<()> {
        let result = if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording fake shared by the netns and router tests.

    use super::{CommandOutput, CommandRunner};
    use std::io;
    use std::path::Path;
    use std::sync::Mutex;

    /// Records every call; scripted failures and outputs match on a
    /// substring of the joined command line.
    #[derive(Default)]
    pub struct RecordingRunner {
        pub calls: Mutex<Vec<String>>,
        pub writes: Mutex<Vec<(String, String)>>,
        pub removals: Mutex<Vec<String>>,
        fail_on: Mutex<Vec<String>>,
        stdout_for: Mutex<Vec<(String, String)>>,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Any command line containing `needle` exits non-zero.
        pub fn fail_matching(&self, needle: &str) {
            self.fail_on.lock().unwrap().push(needle.to_string());
        }

        /// Any command line containing `needle` produces `stdout`.
        pub fn stdout_matching(&self, needle: &str, stdout: &str) {
            self.stdout_for
                .lock()
                .unwrap()
                .push((needle.to_string(), stdout.to_string()));
        }

        pub fn call_lines(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_containing(&self, needle: &str) -> Vec<String> {
            self.call_lines()
                .into_iter()
                .filter(|line| line.contains(needle))
                .collect()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
            let line = format!("{} {}", program, args.join(" "));
            self.calls.lock().unwrap().push(line.clone());

            if self
                .fail_on
                .lock()
                .unwrap()
                .iter()
                .any(|needle| line.contains(needle))
            {
                return Ok(CommandOutput::failed("scripted failure"));
            }

            let stdout = self
                .stdout_for
                .lock()
                .unwrap()
                .iter()
                .find(|(needle, _)| line.contains(needle))
                .map(|(_, out)| out.clone())
                .unwrap_or_default();
            Ok(CommandOutput::ok(stdout))
        }

        fn write_file(&self, path: &Path, contents: &str) -> io::Result<()> {
            self.writes
                .lock()
                .unwrap()
                .push((path.display().to_string(), contents.to_string()));
            Ok(())
        }

        fn remove_path(&self, path: &Path) -> io::Result<()> {
            self.removals
                .lock()
                .unwrap()
                .push(path.display().to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_runner_captures_stdout() {
        let runner = HostRunner::new();
        let out = runner.run("echo", &["hello"]).unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn host_runner_reports_nonzero_exit() {
        let runner = HostRunner::new();
        let out = runner.run("false", &[]).unwrap();
        assert!(!out.success);
    }

    #[test]
    fn host_runner_remove_missing_path_is_ok() {
        let runner = HostRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.conf");
        assert!(runner.remove_path(&path).is_ok());
    }

    #[test]
    fn host_runner_write_creates_parents() {
        let runner = HostRunner::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netns").join("resolv.conf");
        runner.write_file(&path, "nameserver 8.8.8.8\n").unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "nameserver 8.8.8.8\n"
        );
    }
}
