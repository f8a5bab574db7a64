use crate::crypto::backend::{ExecutionMode, KeyCommand};
use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt::Debug;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const SUDO: &str = "sudo";

fn shell() -> (&'static str, &'static str) {
    if cfg!(target_os = "windows") {
        ("cmd.exe", "/C")
    } else {
        ("/bin/sh", "-c")
    }
}

/// How and as whom a [`KeyCommand`] should be run.
#[derive(Clone)]
pub struct ExecOptions {
    /// Run as this OS user instead of the current one
    pub as_user: Option<String>,
    /// Password handed to the elevation tool on stdin
    pub password: Option<String>,
    /// Run with elevated privileges (as root if `as_user` is unset)
    pub elevate: bool,
    pub timeout: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            as_user: None,
            password: None,
            elevate: false,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl Debug for ExecOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecOptions")
            .field("as_user", &self.as_user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("elevate", &self.elevate)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ExecOptions {
    fn needs_elevation_tool(&self) -> bool {
        self.elevate || self.as_user.is_some()
    }
}

/// Combined stdout and stderr of a finished command, split into lines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub lines: Vec<String>,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn new(lines: Vec<String>, exit_code: i32) -> Self {
        Self { lines, exit_code }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Runs key management commands on behalf of the ACME client.
///
/// Implementations decide *how* a command is run (locally, as a different user, ...). Callers only
/// look at the returned lines and exit code. An `Err` is reserved for commands that could not be
/// run at all or did not finish within [`ExecOptions::timeout`].
#[async_trait]
pub trait CommandExecutor: Send + Sync + Debug {
    async fn execute(
        &self,
        command: &KeyCommand,
        options: &ExecOptions,
    ) -> io::Result<CommandOutput>;
}

/// Executes commands as child processes, using `sudo` to switch users or elevate.
///
/// A configured password is only ever written to a separate `sudo -S -v` invocation that caches
/// the credentials. The key command itself runs with `sudo -n` and sees nothing but its own
/// stdin.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    elevation_tool: PathBuf,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::with_elevation_tool(SUDO)
    }

    /// Uses a different `sudo` compatible binary.
    pub fn with_elevation_tool(elevation_tool: impl Into<PathBuf>) -> Self {
        Self {
            elevation_tool: elevation_tool.into(),
        }
    }

    /// The credential caching step, needed when a password is configured.
    fn authentication_line(&self, options: &ExecOptions) -> Option<(Vec<OsString>, Vec<u8>)> {
        if !options.needs_elevation_tool() {
            return None;
        }
        let password = options.password.as_ref()?;
        let mut argv: Vec<OsString> = vec![self.elevation_tool.clone().into()];
        argv.extend(["-S", "-p", ""].map(OsString::from));
        if let Some(user) = &options.as_user {
            argv.extend([OsString::from("-u"), OsString::from(user)]);
        }
        argv.push(OsString::from("-v"));
        let mut stdin = password.as_bytes().to_vec();
        stdin.push(b'\n');
        Some((argv, stdin))
    }

    /// Builds the final argv and the bytes to feed on stdin.
    fn command_line(&self, command: &KeyCommand, options: &ExecOptions) -> (Vec<OsString>, Vec<u8>) {
        let mut argv: Vec<OsString> = Vec::new();
        if options.needs_elevation_tool() {
            // Never prompt here, credentials were cached by the authentication step if needed
            argv.push(self.elevation_tool.clone().into());
            argv.push(OsString::from("-n"));
            if let Some(user) = &options.as_user {
                argv.extend([OsString::from("-u"), OsString::from(user)]);
            }
            argv.push(OsString::from("--"));
        }
        match command.mode {
            ExecutionMode::Direct => argv.extend(command.args.iter().map(OsString::from)),
            ExecutionMode::Shell => {
                let (shell, shell_arg) = shell();
                argv.extend([
                    OsString::from(shell),
                    OsString::from(shell_arg),
                    OsString::from(command.to_shell_line()),
                ]);
            }
        }
        let stdin = command.stdin.clone().unwrap_or_default();
        (argv, stdin)
    }
}

/// Spawns `argv`, feeds `stdin` and collects the output, giving up after `timeout`.
async fn run(
    program_name: &str,
    argv: &[OsString],
    stdin: Vec<u8>,
    timeout: Duration,
) -> io::Result<CommandOutput> {
    let Some((program, args)) = argv.split_first() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "refusing to run an empty command",
        ));
    };
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;

    let mut child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("child stdin was not captured"))?;
    let writer = tokio::spawn(async move {
        let result = child_stdin.write_all(&stdin).await;
        drop(child_stdin);
        result
    });

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| {
            warn!("{program_name} did not finish within {timeout:?}");
            io::Error::new(io::ErrorKind::TimedOut, "command timed out")
        })??;

    match writer.await {
        Ok(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e),
        Err(join_error) => return Err(io::Error::other(join_error)),
        _ => {}
    }

    let lines = String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
        .map(ToString::to_string)
        .collect();
    // Killed by a signal
    let exit_code = output.status.code().unwrap_or(-1);
    Ok(CommandOutput::new(lines, exit_code))
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(
        &self,
        command: &KeyCommand,
        options: &ExecOptions,
    ) -> io::Result<CommandOutput> {
        let program = command.program().unwrap_or_default();
        debug!(
            "Running {program} (as user: {:?}, elevated: {})",
            options.as_user, options.elevate
        );

        if let Some((argv, password)) = self.authentication_line(options) {
            let output = run(SUDO, &argv, password, options.timeout).await?;
            if !output.success() {
                warn!(
                    "Authentication for {:?} failed with exit code {}",
                    options.as_user, output.exit_code
                );
                return Ok(output);
            }
        }

        let (argv, stdin) = self.command_line(command, options);
        run(program, &argv, stdin, options.timeout).await
    }
}
