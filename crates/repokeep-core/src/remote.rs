//! Remote execution channel.
//!
//! Callers never build command strings. Every remote operation is a typed
//! `RemoteCommand`; a transport turns it into an argument vector. The `ssh`
//! transport quotes each word for the remote shell, the local transport
//! spawns the program directly.
//!
//! # Transports
//! - `LocalChannel`: runs on this machine; file requests use the filesystem.
//! - `SshChannel`:   spawns `ssh`; file writes are streamed through stdin.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::config::{TransportConfig, TransportKind};
use crate::error::{RepokeepError, Result};

pub const BACKUP_TOOL_BIN: &str = "pgbackrest";
pub const PSQL_BIN: &str = "psql";

/// ssh reserves this exit status for its own connection failures.
const SSH_CONNECT_FAILURE: i32 = 255;

// ---------------------------------------------------------------------------
// RemoteCommand / ExecOutput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Reachability probe.
    Ping,
    ReadFile { path: String },
    /// Replace the file at `path`; contents travel out of band.
    WriteFile { path: String, contents: String },
    /// Single query through `psql`, unaligned tuples-only output.
    Psql { query: String },
    /// Backup tool invocation with pre-split arguments.
    BackupTool { args: Vec<String> },
}

impl RemoteCommand {
    pub fn backup_tool<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::BackupTool {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Program and arguments run on the target host.
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Ping => vec!["true".to_string()],
            Self::ReadFile { path } => vec!["cat".to_string(), "--".to_string(), path.clone()],
            Self::WriteFile { path, .. } => vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat > "$1.repokeep-tmp" && mv -f "$1.repokeep-tmp" "$1""#.to_string(),
                "sh".to_string(),
                path.clone(),
            ],
            Self::Psql { query } => vec![
                PSQL_BIN.to_string(),
                "-X".to_string(),
                "-A".to_string(),
                "-t".to_string(),
                "-c".to_string(),
                query.clone(),
            ],
            Self::BackupTool { args } => {
                let mut argv = vec![BACKUP_TOOL_BIN.to_string()];
                argv.extend(args.iter().cloned());
                argv
            }
        }
    }

    /// Short label for logs and error messages.
    pub fn label(&self) -> String {
        match self {
            Self::Ping => "ping".to_string(),
            Self::ReadFile { path } => format!("read {path}"),
            Self::WriteFile { path, .. } => format!("write {path}"),
            Self::Psql { .. } => "psql query".to_string(),
            Self::BackupTool { args } => {
                format!("{BACKUP_TOOL_BIN} {}", args.first().map(String::as_str).unwrap_or(""))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// First non-empty of stderr / stdout, truncated for error messages.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        text.chars().take(500).collect()
    }
}

// ---------------------------------------------------------------------------
// RemoteChannel
// ---------------------------------------------------------------------------

pub trait RemoteChannel {
    /// Run `cmd` on `host`. A non-zero exit is returned, not raised; only
    /// transport failures are errors.
    fn execute(&self, host: &str, cmd: &RemoteCommand) -> Result<ExecOutput>;

    fn read_config(&self, host: &str, path: &str) -> Result<String> {
        let out = self.execute(
            host,
            &RemoteCommand::ReadFile {
                path: path.to_string(),
            },
        )?;
        if !out.success() {
            return Err(RepokeepError::connectivity(
                host,
                format!("reading {path} failed: {}", out.diagnostic()),
            ));
        }
        Ok(out.stdout)
    }

    fn write_config(&self, host: &str, path: &str, text: &str) -> Result<()> {
        let out = self.execute(
            host,
            &RemoteCommand::WriteFile {
                path: path.to_string(),
                contents: text.to_string(),
            },
        )?;
        if !out.success() {
            return Err(RepokeepError::connectivity(
                host,
                format!("writing {path} failed: {}", out.diagnostic()),
            ));
        }
        Ok(())
    }
}

/// Build the channel selected by the transport configuration.
pub fn channel_for(config: &TransportConfig) -> Result<Box<dyn RemoteChannel>> {
    match config.kind {
        TransportKind::Local => Ok(Box::new(LocalChannel)),
        TransportKind::Ssh => Ok(Box::new(SshChannel::new(config)?)),
    }
}

// ---------------------------------------------------------------------------
// LocalChannel
// ---------------------------------------------------------------------------

/// Executes every request on this machine, ignoring the host argument.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalChannel;

impl RemoteChannel for LocalChannel {
    fn execute(&self, host: &str, cmd: &RemoteCommand) -> Result<ExecOutput> {
        debug!(host, command = %cmd.label(), "local exec");
        match cmd {
            RemoteCommand::Ping => Ok(ExecOutput::default()),
            RemoteCommand::ReadFile { path } => match std::fs::read_to_string(path) {
                Ok(stdout) => Ok(ExecOutput {
                    exit_code: 0,
                    stdout,
                    stderr: String::new(),
                }),
                Err(e) => Ok(ExecOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("{path}: {e}"),
                }),
            },
            RemoteCommand::WriteFile { path, contents } => {
                crate::io::atomic_write(Path::new(path), contents.as_bytes())?;
                Ok(ExecOutput::default())
            }
            other => {
                let argv = other.argv();
                let output = Command::new(&argv[0])
                    .args(&argv[1..])
                    .stdin(Stdio::null())
                    .output()
                    .map_err(|e| RepokeepError::connectivity(host, format!("{}: {e}", argv[0])))?;
                Ok(ExecOutput {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SshChannel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SshChannel {
    user: Option<String>,
    port: Option<u16>,
    options: Vec<String>,
}

impl SshChannel {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        if which::which("ssh").is_err() {
            return Err(RepokeepError::Configuration(
                "ssh transport selected but no 'ssh' executable is on PATH".to_string(),
            ));
        }
        Ok(Self::unchecked(config))
    }

    fn unchecked(config: &TransportConfig) -> Self {
        Self {
            user: config.ssh_user.clone(),
            port: config.ssh_port,
            options: config.ssh_options.clone(),
        }
    }

    /// Arguments passed to the local `ssh` binary.
    pub fn ssh_args(&self, host: &str, cmd: &RemoteCommand) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        for opt in &self.options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(user) = &self.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        args.push("--".to_string());
        args.push(host.to_string());
        let remote: Vec<String> = cmd.argv().iter().map(|w| shell_quote(w)).collect();
        args.push(remote.join(" "));
        args
    }
}

impl RemoteChannel for SshChannel {
    fn execute(&self, host: &str, cmd: &RemoteCommand) -> Result<ExecOutput> {
        debug!(host, command = %cmd.label(), "ssh exec");
        let stdin_data = match cmd {
            RemoteCommand::WriteFile { contents, .. } => Some(contents.as_str()),
            _ => None,
        };

        let mut command = Command::new("ssh");
        command.args(self.ssh_args(host, cmd));
        command.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| RepokeepError::connectivity(host, format!("failed to spawn ssh: {e}")))?;

        if let Some(data) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(data.as_bytes()).map_err(|e| {
                    RepokeepError::connectivity(host, format!("failed to write stdin: {e}"))
                })?;
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| RepokeepError::connectivity(host, e.to_string()))?;
        let out = ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if out.exit_code == SSH_CONNECT_FAILURE {
            return Err(RepokeepError::connectivity(host, out.diagnostic()));
        }
        Ok(out)
    }
}

/// Quote one word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
