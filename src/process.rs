//! Process runner
//!
//! Every external command pkgmill executes (container runtime CLI, emulator
//! probes) goes through a [`ProcessRunner`], so the orchestration layer can be
//! driven by a scripted runner in tests.

use crate::error::{PkgmillError, PkgmillResult};
use async_trait::async_trait;
use std::borrow::Cow;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

/// A single external command: program, arguments and working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Shell-quoted command line, suitable for copy-pasting into a terminal
    pub fn display(&self) -> String {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        shell_join(words)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Join words into a shell command line, quoting only words that need it.
///
/// Words made of `[A-Za-z0-9_@%+=:,./-]` pass through bare, so flags such as
/// `--network=host` stay readable.
pub fn shell_join<'a>(words: impl IntoIterator<Item = &'a str>) -> String {
    words.into_iter().map(quote_word).collect::<Vec<_>>().join(" ")
}

fn quote_word(word: &str) -> Cow<'_, str> {
    let bare = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"_@%+=:,./-".contains(&b));
    if bare {
        return Cow::Borrowed(word);
    }
    // Only fails on embedded NUL bytes, which cannot reach a real argv
    shlex::try_quote(word).unwrap_or(Cow::Borrowed(word))
}

/// Exit code plus combined stdout/stderr text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: i32,
    pub output: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Exit code plus raw stdout bytes (stderr kept separately as text)
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Executes external commands
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run to completion, capturing stdout and stderr interleaved line by line.
    /// With `live` set, each line is also echoed to stdout as it arrives.
    async fn capture(&self, invocation: &Invocation, live: bool) -> PkgmillResult<ProcessOutput>;

    /// Run to completion, keeping stdout as raw bytes (e.g. tar streams)
    async fn capture_bytes(&self, invocation: &Invocation) -> PkgmillResult<RawOutput>;

    /// Run with the terminal attached (stdin/stdout/stderr inherited)
    async fn interactive(&self, invocation: &Invocation) -> PkgmillResult<i32>;

    /// Run synchronously with all output discarded. Used from `Drop` where no
    /// async context is available.
    fn run_blocking(&self, invocation: &Invocation) -> PkgmillResult<i32>;
}

/// [`ProcessRunner`] backed by real child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn capture(&self, invocation: &Invocation, live: bool) -> PkgmillResult<ProcessOutput> {
        debug!("Executing: {}", invocation.display());

        let mut child = invocation
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PkgmillError::command_failed(invocation.display(), e))?;

        let echo = move |line: String| {
            if live {
                println!("{}", line);
            }
        };
        let lines = stream_child_output(&mut child, &echo).await?;

        let status = child
            .wait()
            .await
            .map_err(|e| PkgmillError::command_failed(invocation.display(), e))?;

        let mut output = lines.join("\n");
        if !lines.is_empty() {
            output.push('\n');
        }
        Ok(ProcessOutput {
            code: status.code().unwrap_or(-1),
            output,
        })
    }

    async fn capture_bytes(&self, invocation: &Invocation) -> PkgmillResult<RawOutput> {
        debug!("Executing: {}", invocation.display());

        let output = invocation
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PkgmillError::command_failed(invocation.display(), e))?;

        Ok(RawOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn interactive(&self, invocation: &Invocation) -> PkgmillResult<i32> {
        debug!("Executing interactively: {}", invocation.display());

        let status = invocation
            .command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| PkgmillError::command_failed(invocation.display(), e))?;

        Ok(status.code().unwrap_or(-1))
    }

    fn run_blocking(&self, invocation: &Invocation) -> PkgmillResult<i32> {
        let mut cmd = std::process::Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }
        let status = cmd
            .status()
            .map_err(|e| PkgmillError::command_failed(invocation.display(), e))?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Outcome of one read from a [`LinePump`]
enum Pumped {
    Line(String),
    Retry,
    Closed,
}

/// Newline-delimited reader tolerating non-UTF-8 bytes and transient errors.
///
/// Partial lines stay in `buf`, so a read cancelled by `select!` resumes where
/// it left off.
struct LinePump<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    failures: u8,
    done: bool,
}

impl<R: AsyncRead + Unpin> LinePump<R> {
    const MAX_FAILURES: u8 = 8;

    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            failures: 0,
            done: false,
        }
    }

    async fn next(&mut self) -> Pumped {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) if self.buf.is_empty() => Pumped::Closed,
            Ok(_) => {
                self.failures = 0;
                Pumped::Line(self.take_line())
            }
            Err(e) if self.failures < Self::MAX_FAILURES => {
                self.failures += 1;
                debug!("Retrying child output read: {}", e);
                Pumped::Retry
            }
            Err(e) => {
                debug!("Giving up on child output: {}", e);
                Pumped::Closed
            }
        }
    }

    fn take_line(&mut self) -> String {
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}

/// Stream stdout+stderr from a child process, calling `on_output` for each line.
///
/// Returns all collected output lines. Both pipes are drained concurrently so
/// a chatty stderr never blocks stdout (or vice versa). Invalid UTF-8 is
/// replaced rather than ending the stream.
pub(crate) async fn stream_child_output(
    child: &mut tokio::process::Child,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> PkgmillResult<Vec<String>> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| PkgmillError::Internal("child stderr was not piped".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PkgmillError::Internal("child stdout was not piped".to_string()))?;

    let mut stderr = LinePump::new(stderr);
    let mut stdout = LinePump::new(stdout);
    let mut all_output = Vec::new();

    let mut record = |pumped: Pumped| match pumped {
        Pumped::Line(line) => {
            on_output(line.clone());
            all_output.push(line);
            false
        }
        Pumped::Retry => false,
        Pumped::Closed => true,
    };

    while !stderr.done || !stdout.done {
        tokio::select! {
            pumped = stderr.next(), if !stderr.done => stderr.done = record(pumped),
            pumped = stdout.next(), if !stdout.done => stdout.done = record(pumped),
        }
    }

    Ok(all_output)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_arguments() {
        let invocation = Invocation::new("docker")
            .arg("run")
            .args(["alpine", "sh", "-c", "echo hello world"]);
        assert_eq!(
            invocation.display(),
            "docker run alpine sh -c 'echo hello world'"
        );
    }

    #[test]
    fn display_leaves_flag_assignments_bare() {
        let invocation = Invocation::new("docker").args([
            "create",
            "--network=host",
            "--pids-limit=-1",
            "-v/srv/src:/io",
            "alpine",
            "sh",
            "-c",
            "",
        ]);
        assert_eq!(
            invocation.display(),
            "docker create --network=host --pids-limit=-1 -v/srv/src:/io alpine sh -c ''"
        );
    }

    #[test]
    fn shell_join_quotes_metacharacters() {
        let joined = shell_join(["echo", "a;b", "$HOME", "it's"]);
        assert!(joined.starts_with("echo "));
        assert_eq!(
            shlex::split(&joined).unwrap(),
            vec!["echo", "a;b", "$HOME", "it's"]
        );
    }

    #[tokio::test]
    async fn capture_survives_invalid_utf8_while_other_pipe_is_open() {
        // 256 KiB after the bad byte overflows the pipe buffer if stdout stops being read
        let script = "printf 'bad \\377 byte\\n'; head -c 262144 /dev/zero | tr '\\0' a; echo; echo done >&2";
        let invocation = Invocation::new("sh").args(["-c", script]);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(20),
            SystemRunner.capture(&invocation, false),
        )
        .await
        .expect("capture did not finish")
        .unwrap();

        assert_eq!(result.code, 0);
        assert!(result.output.contains("bad \u{FFFD} byte\n"));
        assert!(result.output.lines().any(|line| line.len() == 262144));
        assert!(result.output.contains("done\n"));
    }

    #[tokio::test]
    async fn capture_keeps_trailing_partial_line() {
        let invocation = Invocation::new("sh").args(["-c", "printf 'no newline'"]);
        let result = SystemRunner.capture(&invocation, false).await.unwrap();
        assert_eq!(result.output, "no newline\n");
    }

    #[tokio::test]
    async fn capture_interleaves_stdout_and_stderr() {
        let invocation = Invocation::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let result = SystemRunner.capture(&invocation, false).await.unwrap();
        assert_eq!(result.code, 3);
        assert!(result.output.contains("out\n"));
        assert!(result.output.contains("err\n"));
    }

    #[tokio::test]
    async fn capture_bytes_keeps_binary_stdout() {
        let invocation = Invocation::new("sh").args(["-c", "printf 'a\\000b'"]);
        let result = SystemRunner.capture_bytes(&invocation).await.unwrap();
        assert_eq!(result.code, 0);
        assert_eq!(result.stdout, b"a\0b");
    }

    #[tokio::test]
    async fn missing_program_is_command_failed() {
        let invocation = Invocation::new("definitely-not-a-real-program-pkgmill");
        let err = SystemRunner.capture(&invocation, false).await.unwrap_err();
        assert!(matches!(err, PkgmillError::CommandFailed { .. }));
    }

    #[test]
    fn run_blocking_reports_exit_code() {
        let invocation = Invocation::new("sh").args(["-c", "exit 4"]);
        assert_eq!(SystemRunner.run_blocking(&invocation).unwrap(), 4);
    }
}
