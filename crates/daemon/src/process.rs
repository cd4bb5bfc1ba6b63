// SSH Tunnel Keeper - Tunnel Process Module
// Spawns the tunnel program and exposes its merged output without blocking

use std::fmt;
use std::io;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

use ssh_keeper_common::Invocation;

/// How a tunnel process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, None when the process was killed by a signal
    pub code: Option<i32>,
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}", code),
            None => f.write_str("none (terminated by signal)"),
        }
    }
}

/// A running tunnel process as seen by its worker
///
/// Every method returns immediately; none of them waits on the process.
pub trait TunnelProcess: Send {
    /// Process identifier recorded at launch
    fn id(&self) -> Option<u32>;

    /// Next line of merged stdout/stderr, if one is buffered
    fn next_line(&mut self) -> Option<String>;

    /// Exit status, if the process has exited
    fn try_exit(&mut self) -> io::Result<Option<ProcessExit>>;

    /// Ask the process to terminate (SIGTERM); does not wait for it to exit
    fn terminate(&mut self) -> io::Result<()>;
}

/// Starts tunnel processes
pub trait Launcher: Send + Sync {
    fn launch(&self, invocation: &Invocation) -> io::Result<Box<dyn TunnelProcess>>;
}

/// Launcher for real processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SshLauncher;

impl Launcher for SshLauncher {
    fn launch(&self, invocation: &Invocation) -> io::Result<Box<dyn TunnelProcess>> {
        let process = SshProcess::spawn(invocation)?;
        Ok(Box::new(process))
    }
}

/// Child process with stdout and stderr merged into one line channel
#[derive(Debug)]
pub struct SshProcess {
    child: Child,
    pid: Option<u32>,
    lines: mpsc::UnboundedReceiver<String>,
}

impl SshProcess {
    /// Spawn the invocation; must be called from within a tokio runtime
    pub fn spawn(invocation: &Invocation) -> io::Result<Self> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (line_tx, lines) = mpsc::unbounded_channel();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx));
        }

        let pid = child.id();
        Ok(Self { child, pid, lines })
    }
}

impl TunnelProcess for SshProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn next_line(&mut self) -> Option<String> {
        self.lines.try_recv().ok()
    }

    fn try_exit(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| ProcessExit { code: status.code() }))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        // Already reaped, nothing left to signal
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "PID out of range"))?;

        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// Forward trimmed, non-empty lines until EOF or until the receiver is gone
async fn forward_lines<R>(reader: R, line_tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line_tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Stopped reading tunnel output: {}", e);
                break;
            }
        }
    }
}
