use std::{
    env,
    ffi::OsString,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 4096;
const OUTPUT_CHANNEL: usize = 256;

/// What to run inside a new terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
}

impl PtyCommand {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>, cols: u16, rows: u16) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            cols,
            rows,
            env: vec![("TERM".into(), "xterm-256color".into())],
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// One interactive process attached to a pseudo-terminal. Output is read on a
/// dedicated thread and delivered as raw chunks; the channel closes when the
/// process side of the terminal goes away.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send>>,
    pid: Option<u32>,
    reaped: AtomicBool,
}

fn display_path(path: &Path) -> String {
    std::fs::canonicalize(path)
        .ok()
        .and_then(|resolved| resolved.to_str().map(str::to_string))
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Resolve a bare program name against `PATH`.
fn resolve_program(program: &str) -> String {
    if program.contains('/') || program.contains('\\') || program.starts_with('.') {
        return display_path(Path::new(program));
    }

    let search = env::var_os("PATH")
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| {
            #[cfg(unix)]
            {
                OsString::from("/usr/local/bin:/usr/bin:/bin")
            }
            #[cfg(windows)]
            {
                OsString::from(r"C:\Windows\System32;C:\Windows")
            }
        });

    env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .map(|candidate| display_path(&candidate))
        .unwrap_or_else(|| program.to_string())
}

impl PtyProcess {
    pub fn spawn(command: &PtyCommand) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: command.rows,
                cols: command.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut builder = CommandBuilder::new(resolve_program(&command.program));
        builder.args(&command.args);
        builder.cwd(&command.cwd);
        for (key, value) in &command.env {
            builder.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .with_context(|| format!("failed to spawn {}", command.program))?;
        // Only the child keeps the slave side open, so reads hit EOF on exit.
        drop(pair.slave);
        let pid = child.process_id();

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL);
        thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or_default()))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
                tracing::debug!(target = "session_relay::pty", pid = ?pid, "pty reader finished");
            })
            .context("failed to start pty reader thread")?;

        tracing::debug!(
            target = "session_relay::pty",
            pid = ?pid,
            program = %command.program,
            cwd = %command.cwd.display(),
            "spawned pty process"
        );

        Ok((
            Self {
                master: Mutex::new(pair.master),
                writer: Mutex::new(writer),
                child: Mutex::new(child),
                pid,
                reaped: AtomicBool::new(false),
            },
            rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(bytes).context("pty write failed")?;
        writer.flush().context("pty flush failed")?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize pty")
    }

    /// Non-blocking exit check.
    pub fn has_exited(&self) -> bool {
        if self.reaped.load(Ordering::Relaxed) {
            return true;
        }
        match self.child.lock().try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(target = "session_relay::pty", pid = ?self.pid, success = status.success(), "child exited");
                self.reaped.store(true, Ordering::Relaxed);
                true
            }
            Ok(None) => false,
            // Already reaped elsewhere.
            Err(_) => {
                self.reaped.store(true, Ordering::Relaxed);
                true
            }
        }
    }

    /// Kill and reap the child. Safe to call more than once.
    pub fn terminate(&self) {
        if self.reaped.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut child = self.child.lock();
        if let Err(error) = child.kill() {
            tracing::debug!(target = "session_relay::pty", pid = ?self.pid, error = %error, "kill failed");
        }
        let _ = child.wait();
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        sync::mpsc,
        time::{timeout, Duration},
    };

    use super::{PtyCommand, PtyProcess};

    async fn read_until(rx: &mut mpsc::Receiver<Vec<u8>>, needle: &str) -> String {
        let mut collected = Vec::new();
        while let Ok(Some(chunk)) = timeout(Duration::from_secs(3), rx.recv()).await {
            collected.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&collected).contains(needle) {
                break;
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    }

    #[tokio::test]
    async fn runs_in_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let command = PtyCommand::new("sh", dir.path(), 80, 24).args(["-c", "pwd"]);
        let (_pty, mut rx) = PtyProcess::spawn(&command).unwrap();
        let output = read_until(&mut rx, "\n").await;
        let expected = dir.path().canonicalize().unwrap();
        let name = expected.file_name().unwrap().to_string_lossy().into_owned();
        assert!(output.contains(&name), "{output:?}");
    }

    #[tokio::test]
    async fn input_is_echoed_back() {
        let dir = tempfile::tempdir().unwrap();
        let (pty, mut rx) = PtyProcess::spawn(&PtyCommand::new("cat", dir.path(), 80, 24)).unwrap();
        pty.write_all(b"ping-from-test\n").unwrap();
        let output = read_until(&mut rx, "ping-from-test").await;
        assert!(output.contains("ping-from-test"));
        pty.terminate();
    }

    #[tokio::test]
    async fn resize_succeeds_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let command = PtyCommand::new("sleep", dir.path(), 80, 24).args(["5"]);
        let (pty, _rx) = PtyProcess::spawn(&command).unwrap();
        assert!(pty.resize(120, 40).is_ok());
        assert!(!pty.has_exited());
        pty.terminate();
        assert!(pty.has_exited());
    }

    #[tokio::test]
    async fn output_channel_closes_when_process_exits() {
        let dir = tempfile::tempdir().unwrap();
        let (pty, mut rx) = PtyProcess::spawn(&PtyCommand::new("true", dir.path(), 80, 24)).unwrap();
        let closed = timeout(Duration::from_secs(3), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pty.has_exited());
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let command = PtyCommand::new("sleep", dir.path(), 80, 24).args(["30"]);
        let (pty, mut rx) = PtyProcess::spawn(&command).unwrap();
        pty.terminate();
        pty.terminate();
        let result = timeout(Duration::from_secs(3), rx.recv()).await;
        assert!(result.is_ok());
    }
}
