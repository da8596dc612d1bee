//! Blocking subprocess execution with a deadline

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::deploy::stage::StageResult;
use crate::errors::DeployError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long output is still collected once the command itself has exited.
/// Background children may keep the pipes open for much longer.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Captured result of a finished (or killed) command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map(|s| s.success()).unwrap_or(false)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text
    }

    pub fn into_stage(self, stage: &str, timeout: Duration) -> StageResult {
        let mut output = self.combined();
        if self.timed_out {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&format!("killed after {}s timeout\n", timeout.as_secs()));
        } else if let Some(status) = self.status.filter(|s| !s.success()) {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&format!("{}\n", status));
        }
        if self.success() {
            StageResult::success(stage, output)
        } else {
            StageResult::failure(stage, output)
        }
    }
}

/// Render a command line for logs
pub fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Run `cmd` to completion on the current thread, killing its whole process
/// group once `timeout` elapses. Only a failure to spawn is an error.
///
/// The call returns shortly after the command exits even when it left
/// background processes behind; their later output is not captured.
pub fn run(cmd: &mut Command, timeout: Duration) -> Result<CommandOutput, DeployError> {
    let line = describe(cmd);
    debug!("Running: {}", line);

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| DeployError::InfrastructureError(format!("failed to start `{}`: {}", line, e)))?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let started = Instant::now();
    let mut timed_out = false;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None if started.elapsed() >= timeout => {
                warn!("`{}` exceeded {}s, killing", line, timeout.as_secs());
                kill_group(&mut child);
                timed_out = true;
                break child.wait().ok();
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    let deadline = Instant::now() + OUTPUT_GRACE;
    Ok(CommandOutput {
        status,
        stdout: stdout.map(|c| c.collect(deadline)).unwrap_or_default(),
        stderr: stderr.map(|c| c.collect(deadline)).unwrap_or_default(),
        timed_out,
    })
}

fn kill_group(child: &mut std::process::Child) {
    // The child leads its own group, so the group id is its pid
    match i32::try_from(child.id()) {
        Ok(pgid) => {
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                warn!("Failed to kill process group {}: {}", pgid, e);
                let _ = child.kill();
            }
        }
        Err(_) => {
            let _ = child.kill();
        }
    }
}

/// Output of one pipe, read on a helper thread
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    eof: mpsc::Receiver<()>,
}

impl Capture {
    /// Whatever was read by `deadline`, or everything if the pipe closed
    /// earlier. The reader thread is left to finish on its own.
    fn collect(self, deadline: Instant) -> String {
        let _ = self.eof.recv_timeout(deadline.saturating_duration_since(Instant::now()));
        let text = match self.buf.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        };
        text
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> Capture {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let (tx, eof) = mpsc::channel();
    let shared = buf.clone();
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk) {
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Ok(0) | Err(_) => break,
                Ok(n) => match shared.lock() {
                    Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                    Err(_) => break,
                },
            }
        }
        let _ = tx.send(());
    });
    Capture { buf, eof }
}
