//! Helpers for spawning wrapped commands.
//!
//! Compiler invocations can be extremely chatty, and their stdout/stderr must
//! be captured *verbatim* — the cache replays the captured bytes on a hit, so
//! lossy UTF-8 conversion or unbounded in-memory buffering are both wrong.
//! This crate provides bounded byte capture with an optional wall-clock
//! timeout.

use std::{
    fmt,
    io::{self, Read},
    path::PathBuf,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

/// Options controlling command execution.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Kill the process if it hasn't exited after this duration.
    pub timeout: Option<Duration>,
    /// Maximum bytes to capture *per stream* (stdout and stderr).
    pub max_bytes: usize,
    /// How long to wait after a graceful termination signal before
    /// force-killing the process tree.
    pub kill_grace: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            // Preprocessed translation units routinely run to tens of MiB;
            // the cap exists to bound memory, not to trim ordinary output.
            max_bytes: 256 * 1024 * 1024,
            kill_grace: Duration::from_millis(250),
        }
    }
}

/// A full command invocation (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, args: &[String]) -> Self {
        Self {
            program: program.into(),
            args: args.to_vec(),
        }
    }

    /// Build a spec from a raw argv, prepending an optional launcher prefix
    /// (e.g. a distribution tool) to the command.
    pub fn from_argv_with_prefix(argv: &[String], prefix: &[String]) -> Option<Self> {
        let mut full: Vec<String> = prefix.to_vec();
        full.extend_from_slice(argv);
        let (program, args) = full.split_first()?;
        Some(Self::new(program, args))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Human-readable debugging output, not a round-trippable shell line.
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(' ') || arg.contains('\t') {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Result of running a command with bounded output capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub return_code: i32,
    pub std_out: Vec<u8>,
    pub std_err: Vec<u8>,
    /// Set when either stream had more bytes than were captured. Truncated
    /// output must never be cached.
    pub truncated: bool,
    pub timed_out: bool,
}

/// Run a command, capturing at most `opts.max_bytes` bytes of stdout and
/// stderr each.
///
/// When the timeout is reached the process (group) is killed and `timed_out`
/// is set. A process terminated by a signal reports return code `-1`.
pub fn run_command(spec: &CommandSpec, opts: &RunOptions) -> io::Result<RunResult> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Put the child into its own process group on Unix so timeouts can kill
    // the whole process tree (compiler drivers fork cc1/as children that
    // would otherwise keep the output pipes open).
    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;

        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate.
            // This runs after `fork` in the child process.
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;

    let Some(stdout) = child.stdout.take() else {
        return Err(io::Error::other("child stdout was not captured"));
    };
    let Some(stderr) = child.stderr.take() else {
        return Err(io::Error::other("child stderr was not captured"));
    };

    let max_bytes = opts.max_bytes;
    let stdout_handle = thread::spawn(move || read_bounded(stdout, max_bytes));
    let stderr_handle = thread::spawn(move || read_bounded(stderr, max_bytes));

    let start = Instant::now();
    let mut timed_out = false;

    let status = if let Some(timeout) = opts.timeout {
        let poll = Duration::from_millis(50);
        loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() >= timeout {
                timed_out = true;
                break terminate_process_tree(&mut child, opts.kill_grace)?;
            }
            thread::sleep(poll.min(timeout.saturating_sub(start.elapsed())));
        }
    } else {
        child.wait()?
    };

    let (std_out, stdout_truncated) = join_reader(stdout_handle, "stdout")??;
    let (std_err, stderr_truncated) = join_reader(stderr_handle, "stderr")??;

    Ok(RunResult {
        return_code: status.code().unwrap_or(-1),
        std_out,
        std_err,
        truncated: stdout_truncated || stderr_truncated,
        timed_out,
    })
}

fn terminate_process_tree(
    child: &mut std::process::Child,
    grace: Duration,
) -> io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        let pid = child.id() as i32;
        // Negative pid targets the process group set via `setpgid(0, 0)`.
        unsafe {
            let _ = libc::kill(-pid, libc::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(25));
        }

        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
        }
        child.wait()
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        let _ = child.kill();
        child.wait()
    }
}

fn join_reader(
    handle: thread::JoinHandle<io::Result<(Vec<u8>, bool)>>,
    stream: &'static str,
) -> io::Result<io::Result<(Vec<u8>, bool)>> {
    handle
        .join()
        .map_err(|_| io::Error::other(format!("{stream} reader thread panicked")))
}

fn read_bounded(mut reader: impl Read, max_bytes: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8 * 1024];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        if out.len() < max_bytes {
            let remaining = max_bytes - out.len();
            let to_store = remaining.min(n);
            out.extend_from_slice(&buf[..to_store]);
            if to_store < n {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }

    Ok((out, truncated))
}
