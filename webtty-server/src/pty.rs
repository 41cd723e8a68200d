use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const READ_CHUNK: usize = 1024;
const OUTPUT_CHANNEL: usize = 64;
const INPUT_CHANNEL: usize = 1024;
/// How long a child may linger after the close signal before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to allocate pty: {0}")]
    Open(nix::Error),
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("pty i/o setup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A child process attached to a fresh pty.
///
/// The master endpoint is pumped by two dedicated threads so the async side
/// only ever touches channels: reads arrive on a bounded `Bytes` channel,
/// writes are queued on another. The reader thread exits on EOF/EIO once the
/// child is gone; the writer thread exits when the input channel closes.
#[derive(Debug)]
pub struct PtyProcess {
    child: Child,
    master: Arc<OwnedFd>,
    pid: i32,
    output_rx: Option<mpsc::Receiver<Bytes>>,
    input_tx: mpsc::Sender<Bytes>,
}

/// Cheap handle for issuing window-size changes on the master.
#[derive(Clone)]
pub struct PtyResizer {
    master: Arc<OwnedFd>,
}

impl PtyProcess {
    /// Start `argv[0]` with the remaining arguments on a new pty, optionally
    /// under different credentials. `dims` of `Some` sets the initial window
    /// size; `None` leaves sizing to the first resize request.
    pub fn spawn(
        argv: &[String],
        run_as: Option<(u32, u32)>,
        dims: Option<(u16, u16)>,
    ) -> Result<Self, PtyError> {
        let (program, args) = argv.split_first().ok_or(PtyError::EmptyCommand)?;

        let winsize = dims.map(|(cols, rows)| Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        });
        let pty = openpty(
            winsize.as_ref(),
            Option::<&nix::sys::termios::Termios>::None,
        )
        .map_err(PtyError::Open)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("TERM", "xterm")
            .stdin(Stdio::from(pty.slave.try_clone()?))
            .stdout(Stdio::from(pty.slave.try_clone()?))
            .stderr(Stdio::from(pty.slave));
        if let Some((uid, gid)) = run_as {
            cmd.uid(uid).gid(gid);
        }
        // The child must own the slave as its controlling terminal.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| PtyError::Spawn {
            command: program.clone(),
            source,
        })?;
        let pid = child.id().map(|p| p as i32).unwrap_or(-1);
        let master = Arc::new(pty.master);

        let (output_tx, output_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL);
        let reader_fd = master.try_clone()?;
        thread::Builder::new()
            .name("webtty-pty-reader".to_string())
            .spawn(move || {
                let mut reader = File::from(reader_fd);
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if output_tx
                                .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        // EIO when the child exits and the last slave closes.
                        Err(_) => break,
                    }
                }
            })?;

        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL);
        let writer_fd = master.try_clone()?;
        thread::Builder::new()
            .name("webtty-pty-writer".to_string())
            .spawn(move || {
                let mut writer = File::from(writer_fd);
                while let Some(data) = input_rx.blocking_recv() {
                    if writer.write_all(&data).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            })?;

        Ok(Self {
            child,
            master,
            pid,
            output_rx: Some(output_rx),
            input_tx,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Take the output channel. Yields `None` after the first call.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.output_rx.take()
    }

    pub fn input_sender(&self) -> mpsc::Sender<Bytes> {
        self.input_tx.clone()
    }

    pub fn resizer(&self) -> PtyResizer {
        PtyResizer {
            master: Arc::clone(&self.master),
        }
    }

    /// Deliver a POSIX signal to the child.
    pub fn signal(&self, signum: i32) -> Result<(), nix::Error> {
        if self.pid <= 0 {
            return Err(nix::Error::ESRCH);
        }
        let sig = Signal::try_from(signum)?;
        signal::kill(Pid::from_raw(self.pid), sig)
    }

    /// Send the configured close signal, wait for the child within the grace
    /// period, and escalate to SIGKILL if it refuses to die.
    pub async fn shutdown(mut self, close_signal: i32) {
        if let Err(e) = self.signal(close_signal) {
            debug!(pid = self.pid, signal = close_signal, error = %e, "close signal not delivered");
        }
        match tokio::time::timeout(KILL_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = self.pid, %status, "child exited");
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "failed to reap child");
            }
            Err(_) => {
                warn!(pid = self.pid, "child ignored close signal, sending SIGKILL");
                let _ = self.signal(libc::SIGKILL);
                if let Ok(status) = self.child.wait().await {
                    debug!(pid = self.pid, %status, "child exited after SIGKILL");
                }
            }
        }
    }
}

impl PtyResizer {
    /// Apply a new window size via TIOCSWINSZ.
    pub fn resize(&self, cols: u16, rows: u16) -> std::io::Result<()> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe {
            libc::ioctl(
                self.master.as_raw_fd(),
                libc::TIOCSWINSZ as libc::c_ulong,
                &winsize,
            )
        };
        if rc == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    async fn collect_output(
        rx: &mut mpsc::Receiver<Bytes>,
        needle: &str,
        deadline: Duration,
    ) -> String {
        let start = Instant::now();
        let mut collected = Vec::new();
        while start.elapsed() < deadline {
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(chunk)) => {
                    collected.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&collected).contains(needle) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    }

    #[tokio::test]
    async fn spawned_child_echoes_through_the_pty() {
        let mut pty =
            PtyProcess::spawn(&argv(&["cat"]), None, Some((80, 24))).expect("spawn cat");
        assert!(pty.pid() > 0);

        let mut output = pty.take_output().expect("output channel");
        assert!(pty.take_output().is_none(), "output channel taken once");

        pty.input_sender()
            .send(Bytes::from_static(b"hello pty\n"))
            .await
            .expect("send input");

        let collected = collect_output(&mut output, "hello pty", Duration::from_secs(5)).await;
        assert!(
            collected.contains("hello pty"),
            "expected echo in output, got: {collected:?}"
        );

        pty.shutdown(libc::SIGHUP).await;
    }

    #[tokio::test]
    async fn resize_applies_to_a_live_pty() {
        let pty = PtyProcess::spawn(&argv(&["cat"]), None, Some((80, 24))).expect("spawn cat");
        let resizer = pty.resizer();
        resizer.resize(132, 43).expect("resize");
        pty.shutdown(libc::SIGHUP).await;
    }

    #[tokio::test]
    async fn shutdown_escalates_when_the_signal_is_ignored() {
        // A shell that traps SIGHUP forces the grace period to expire.
        let pty = PtyProcess::spawn(
            &argv(&["sh", "-c", "trap '' HUP; sleep 60"]),
            None,
            Some((80, 24)),
        )
        .expect("spawn sh");
        let started = Instant::now();
        pty.shutdown(libc::SIGHUP).await;
        let elapsed = started.elapsed();
        assert!(
            elapsed >= KILL_GRACE,
            "shutdown returned before the grace period: {elapsed:?}"
        );
        assert!(
            elapsed < KILL_GRACE + Duration::from_secs(5),
            "SIGKILL escalation took too long: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = PtyProcess::spawn(&[], None, None).expect_err("must fail");
        assert!(matches!(err, PtyError::EmptyCommand));
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_error() {
        let err = PtyProcess::spawn(&argv(&["/no/such/webtty-binary"]), None, None)
            .expect_err("must fail");
        assert!(matches!(err, PtyError::Spawn { .. }));
    }
}
