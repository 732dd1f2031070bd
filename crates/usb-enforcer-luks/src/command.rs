//! Execution wrapper for the external utilities the enforcer drives.
//!
//! Shell integration stays in this module so the provider logic above it can
//! be exercised with fake binaries and canned stdout/stderr.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use usb_enforcer_core::error::{EnforcerError, EnforcerResult};

#[derive(Debug, Clone)]
pub(crate) struct ToolCommand {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) status: i32,
}

impl Output {
    pub(crate) fn success(&self) -> bool {
        self.status == 0
    }

    /// Prefer stderr, fall back to stdout.
    pub(crate) fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            stderr.to_string()
        } else {
            self.stdout.trim().to_string()
        }
    }
}

impl ToolCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    /// Same binary with a different deadline (formatting runs much longer).
    pub(crate) fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            binary: self.binary.clone(),
            timeout,
        }
    }

    pub(crate) fn binary(&self) -> &Path {
        &self.binary
    }

    pub(crate) fn name(&self) -> String {
        self.binary
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.binary.display().to_string())
    }

    /// Run and turn a non-zero exit into a classified error.
    pub(crate) fn run_checked(
        &self,
        args: &[&str],
        input: Option<&[u8]>,
        action: &str,
    ) -> EnforcerResult<Output> {
        let out = self.run(args, input)?;
        if out.success() {
            return Ok(out);
        }
        Err(classify_failure(&self.name(), action, &out))
    }

    pub(crate) fn run(&self, args: &[&str], input: Option<&[u8]>) -> EnforcerResult<Output> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            EnforcerError::Provider(format!("failed to spawn {}: {err}", self.binary.display()))
        })?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // A tool that bails out early closes its end; the exit status says why.
                match stdin.write_all(payload).and_then(|_| stdin.flush()) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
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
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> EnforcerResult<Output> {
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
            return Err(EnforcerError::Provider(format!(
                "{} timed out after {:?}",
                self.binary.display(),
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| EnforcerError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| EnforcerError::Provider("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<EnforcerResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> EnforcerResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

pub(crate) fn dev_mapper_node_exists(name: &str) -> bool {
    let root = Path::new("/dev/mapper");
    root.is_dir() && root.join(name).exists()
}

/// Older cryptsetup builds only know the `luks*` verbs.
pub(crate) fn action_unsupported(output: &Output) -> bool {
    let lower = output.diagnostic().to_ascii_lowercase();
    lower.contains("unknown action")
        || lower.contains("unknown command")
        || lower.contains("invalid action")
        || lower.contains("invalid command")
        || lower.contains("unknown option")
}

fn shown(diagnostic: &str) -> String {
    let trimmed = diagnostic.trim();
    if trimmed.is_empty() {
        "no additional output".to_string()
    } else {
        trimmed.to_string()
    }
}

fn is_busy(lower: &str) -> bool {
    lower.contains("device or resource busy") || lower.contains("target is busy")
}

fn is_permission(lower: &str) -> bool {
    lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
}

/// Map a failed invocation onto the error taxonomy.
///
/// Busy devices surface as [`EnforcerError::DeviceBusy`] so callers can retry.
pub(crate) fn classify_failure(tool: &str, action: &str, output: &Output) -> EnforcerError {
    let diagnostic = output.diagnostic();
    let lower = diagnostic.to_ascii_lowercase();
    let diagnostic = shown(&diagnostic);

    if is_busy(&lower) {
        return EnforcerError::DeviceBusy(format!("{tool} could not {action}: {diagnostic}"));
    }
    if is_permission(&lower) {
        return EnforcerError::Provider(format!(
            "{tool} could not {action}: {diagnostic}. This requires root privileges"
        ));
    }
    EnforcerError::Provider(format!(
        "{tool} failed to {action}: {diagnostic} (exit code {})",
        output.status
    ))
}

pub(crate) fn classify_open_failure(name: &str, source: &str, output: &Output) -> EnforcerError {
    let diagnostic = output.diagnostic();
    let lower = diagnostic.to_ascii_lowercase();

    if lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("keyslot")
        || lower.contains("key slot")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
    {
        return EnforcerError::Provider(format!(
            "passphrase was rejected for `{source}`: {}",
            shown(&diagnostic)
        ));
    }

    if lower.contains("already exists") && dev_mapper_node_exists(name) {
        return EnforcerError::Provider(format!(
            "mapping `{name}` is already active under /dev/mapper; cryptsetup reported: {}",
            shown(&diagnostic)
        ));
    }

    if lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("cannot open device")
    {
        return EnforcerError::Provider(format!(
            "cryptsetup could not access `{source}`: {}. The device may have been removed",
            shown(&diagnostic)
        ));
    }

    classify_failure("cryptsetup", &format!("open `{source}` as `{name}`"), output)
}

/// `true` when a close/umount failed only because there was nothing to tear down.
pub(crate) fn already_gone(output: &Output) -> bool {
    let lower = output.diagnostic().to_ascii_lowercase();
    lower.contains("does not exist")
        || lower.contains("doesn't exist")
        || lower.contains("not active")
        || lower.contains("not mounted")
        || lower.contains("no mount point specified")
}
