//! Post-render command execution.
//!
//! Commands are split into a program and arguments with POSIX-style quoting
//! and run directly, without a shell. Shell features need an explicit
//! interpreter, e.g. `/bin/sh -c 'systemctl reload vault || true'`.
//!
//! Every command runs as the leader of its own process group so a timeout can
//! kill it together with anything it spawned.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CommandError;

/// Bytes of stdout and stderr kept per command.
pub const DEFAULT_OUTPUT_LIMIT: usize = 32 * 1024;

/// Marker appended to output that was cut at the limit.
pub const TRUNCATED_MARKER: &str = "\n[output truncated]";

/// How long to keep draining output after the process has exited.
const OUTPUT_DRAIN_WAIT: Duration = Duration::from_millis(500);

/// A tokenized command: program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    raw: String,
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Tokenizes a command string.
    ///
    /// Whitespace separates words. Single quotes preserve everything up to
    /// the closing quote. Double quotes allow `\"`, `\\`, `\$` and `` \` ``
    /// escapes. A backslash outside quotes escapes the next character.
    pub fn parse(raw: &str) -> Result<Self, CommandError> {
        let mut words = tokenize(raw)?.into_iter();
        let program = words
            .next()
            .ok_or_else(|| CommandError::Invalid("empty command".to_string()))?;
        Ok(Self {
            raw: raw.trim().to_string(),
            program,
            args: words.collect(),
        })
    }

    /// The executable.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments after the program.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The command as configured.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn tokenize(raw: &str) -> Result<Vec<String>, CommandError> {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    word.push(c);
                }
            }
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\' | '$' | '`')) => word.push(next),
                    Some(next) => {
                        word.push('\\');
                        word.push(next);
                    }
                    None => break,
                },
                _ => word.push(c),
            },
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => {
                    let next = chars.next().ok_or_else(|| {
                        CommandError::Invalid("trailing backslash".to_string())
                    })?;
                    word.push(next);
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut word));
                        in_word = false;
                    }
                }
                _ => {
                    word.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote != Quote::None {
        return Err(CommandError::Invalid("unterminated quote".to_string()));
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

/// Result of a command that exited successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall time from spawn to exit.
    pub elapsed: Duration,
}

/// Runs commands with a timeout and bounded output capture.
#[derive(Debug, Clone, Copy)]
pub struct CommandExecutor {
    output_limit: usize,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self {
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

impl CommandExecutor {
    /// Creates an executor with the default output limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides how many bytes of each stream are kept.
    #[must_use]
    pub const fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Runs `command` and waits for it to exit or for `timeout` to elapse.
    ///
    /// On timeout the whole process group is killed with `SIGKILL`. If the
    /// returned future is dropped before completion the group is killed too.
    pub async fn run(
        &self,
        command: &CommandLine,
        timeout: Duration,
    ) -> Result<CommandOutcome, CommandError> {
        let mut child = Command::new(command.program())
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: command.program().to_string(),
                source,
            })?;
        let started = Instant::now();
        let mut group = ProcessGroup::new(child.id());
        debug!(command = %command, pid = ?child.id(), "command started");

        let stdout = child
            .stdout
            .take()
            .map(|stream| tokio::spawn(read_limited(stream, self.output_limit)));
        let stderr = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(read_limited(stream, self.output_limit)));

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                // Leave anything the command backgrounded alone.
                group.release();
                let stdout = collect(stdout).await;
                let stderr = collect(stderr).await;
                if status.success() {
                    Ok(CommandOutcome {
                        stdout,
                        stderr,
                        elapsed: started.elapsed(),
                    })
                } else {
                    use std::os::unix::process::ExitStatusExt;
                    Err(CommandError::NonZeroExit {
                        code: status.code(),
                        signal: status.signal(),
                        stdout,
                        stderr,
                    })
                }
            }
            Ok(Err(source)) => Err(CommandError::Wait(source)),
            Err(_) => {
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to reap timed out command");
                }
                let stdout = collect(stdout).await;
                let stderr = collect(stderr).await;
                Err(CommandError::Timeout {
                    timeout,
                    stdout,
                    stderr,
                })
            }
        }
    }
}

/// Kills a process group when dropped unless released.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    fn release(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[allow(unsafe_code)]
fn kill_process_group(pgid: i32) {
    // SAFETY: killpg only sends a signal and touches no memory of ours.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, error = %err, "failed to kill process group");
        }
    }
}

async fn read_limited<R: AsyncRead + Unpin>(mut stream: R, limit: usize) -> String {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATED_MARKER);
    }
    text
}

async fn collect(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_WAIT, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // A backgrounded grandchild still holds the pipe open.
            handle.abort();
            String::new()
        }
    }
}
