//! Spawns the host binaries (`zfs`, `zpool`, `killall`) with a timeout and
//! collects what they print.

use log::debug;
use remote_unlock_core::error::{UnlockError, UnlockResult};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// A binary path plus the timeout applied to every invocation.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    path: PathBuf,
    timeout: Duration,
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Trimmed stderr, or stdout when stderr is empty.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

impl CommandRunner {
    /// Wrap an existing binary; fails when `path` does not exist.
    pub fn with_path(path: PathBuf, timeout: Duration) -> UnlockResult<Self> {
        if !path.exists() {
            return Err(UnlockError::InvalidConfig(format!(
                "binary not found at {}",
                path.display()
            )));
        }
        Ok(Self { path, timeout })
    }

    /// Use the first of `candidates` that exists.
    pub fn discover(name: &str, candidates: &[&str], timeout: Duration) -> UnlockResult<Self> {
        candidates
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
            .map(|p| Self {
                path: p.to_path_buf(),
                timeout,
            })
            .ok_or_else(|| {
                UnlockError::InvalidConfig(format!(
                    "unable to locate {name} binary; tried {candidates:?}"
                ))
            })
    }

    /// Configured path if given, discovery otherwise.
    pub fn resolve(
        name: &str,
        configured: Option<&Path>,
        candidates: &[&str],
        timeout: Duration,
    ) -> UnlockResult<Self> {
        match configured {
            Some(path) => Self::with_path(path.to_path_buf(), timeout),
            None => Self::discover(name, candidates, timeout),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.path
    }

    /// Run with `args`, optionally feeding `input` on stdin, and capture the result.
    pub fn run(&self, args: &[&str], input: Option<&[u8]>) -> UnlockResult<Output> {
        let mut command = Command::new(&self.path);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;

        if let Some(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                match stdin.write_all(bytes).and_then(|_| stdin.flush()) {
                    Ok(()) => {}
                    // The child may exit without reading its input.
                    Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                        debug!("{} closed stdin early", self.path.display());
                    }
                    Err(err) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(err.into());
                    }
                }
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe, args)
    }

    /// Run and turn a non-zero exit into a provider error carrying the diagnostic.
    pub fn run_checked(&self, args: &[&str]) -> UnlockResult<Output> {
        let out = self.run(args, None)?;
        if !out.success() {
            return Err(self.failure(args, &out));
        }
        Ok(out)
    }

    /// Describe a failed invocation.
    pub fn failure(&self, args: &[&str], output: &Output) -> UnlockError {
        let diagnostic = output.diagnostic();
        UnlockError::Provider(format!(
            "{} {} exited with code {}: {}",
            self.path.display(),
            args.join(" "),
            output.status,
            if diagnostic.is_empty() {
                "no additional output"
            } else {
                diagnostic
            }
        ))
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
        args: &[&str],
    ) -> UnlockResult<Output> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(UnlockError::Provider(format!(
                "{} {} timed out after {:?}",
                self.path.display(),
                args.join(" "),
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| UnlockError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| UnlockError::Provider("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }
}

/// Drain a pipe on a helper thread so a chatty child never blocks on a full pipe.
fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<UnlockResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> UnlockResult<String> {
        let Some(mut reader) = pipe else {
            return Ok(String::new());
        };
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn captures_output_and_status() {
        let tmp = tempdir().unwrap();
        let path = script(
            tmp.path(),
            "echo.sh",
            "#!/bin/sh\nread line\necho \"got $line\"\necho oops >&2\nexit 3\n",
        );
        let runner = CommandRunner::with_path(path, Duration::from_secs(5)).unwrap();

        let out = runner.run(&[], Some(b"secret\n")).unwrap();
        assert_eq!(out.stdout.trim(), "got secret");
        assert_eq!(out.diagnostic(), "oops");
        assert_eq!(out.status, 3);
        assert!(!out.success());
    }

    #[test]
    fn run_checked_reports_diagnostic() {
        let tmp = tempdir().unwrap();
        let path = script(tmp.path(), "fail.sh", "#!/bin/sh\necho 'no pools available' >&2\nexit 1\n");
        let runner = CommandRunner::with_path(path, Duration::from_secs(5)).unwrap();

        let err = runner.run_checked(&["list"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exited with code 1"), "{msg}");
        assert!(msg.contains("no pools available"), "{msg}");
    }

    #[test]
    fn slow_commands_time_out() {
        let tmp = tempdir().unwrap();
        let path = script(tmp.path(), "slow.sh", "#!/bin/sh\nsleep 5\n");
        let runner = CommandRunner::with_path(path, Duration::from_millis(200)).unwrap();

        let err = runner.run(&["get"], None).unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[test]
    fn discovery_picks_first_existing_candidate() {
        let tmp = tempdir().unwrap();
        let present = script(tmp.path(), "zfs", "#!/bin/sh\n");
        let missing = tmp.path().join("nope");
        let candidates = [
            missing.to_str().unwrap(),
            present.to_str().unwrap(),
        ];

        let runner = CommandRunner::discover("zfs", &candidates, Duration::from_secs(1)).unwrap();
        assert_eq!(runner.binary(), present.as_path());

        let err = CommandRunner::discover("zfs", &candidates[..1], Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, UnlockError::InvalidConfig(_)));
    }

    #[test]
    fn configured_path_must_exist() {
        let err = CommandRunner::resolve(
            "zpool",
            Some(Path::new("/definitely/not/here/zpool")),
            &[],
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(err.to_string().contains("binary not found"), "{err}");
    }
}
