use crate::config::SshConfig;
use crate::error::ExpError;
use crate::process::ProcessHandle;
use crate::Host;
use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

// ssh exits with this status when it couldn't connect
const SSH_CONNECTION_ERROR: i32 = 255;
const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "BatchMode=yes",
    "-o",
    "LogLevel=ERROR",
];

/// A command as a list of arguments, with optional working directory and
/// environment. Arguments are quoted only when the command crosses ssh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCommand {
    cwd: Option<String>,
    env: Vec<(String, String)>,
    args: Vec<String>,
}

impl RemoteCommand {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            cwd: None,
            env: Vec::new(),
            args,
        }
    }

    /// Splits a command line on whitespace.
    pub fn parse(line: &str) -> Self {
        Self::new(line.split_whitespace().map(String::from).collect())
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.env.push((key.into(), value.to_string()));
        self
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    /// Prepends `prefix` to the argument list, e.g. `numactl -C 3`.
    pub fn wrap(mut self, prefix: Vec<String>) -> Self {
        let mut args = prefix;
        args.append(&mut self.args);
        self.args = args;
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// The command as a single shell line, every argument quoted once.
    pub fn shell_line(&self) -> String {
        let mut parts = Vec::new();
        if let Some(cwd) = &self.cwd {
            parts.push(format!("cd {} &&", shell_quote(cwd)));
        }
        for (key, value) in &self.env {
            parts.push(format!("{}={}", key, shell_quote(value)));
        }
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.shell_line())
    }
}

/// Quotes `arg` for a POSIX shell, leaving plain words untouched.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg.chars().all(|c| {
            c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c)
        });
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

fn open_sink(path: &Path) -> Result<std::fs::File, Report> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .wrap_err_with(|| format!("open {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Machine {
    Ssh {
        user: Option<String>,
        ssh_address: String,
        key: Option<PathBuf>,
        forward_agent: bool,
    },
    Local,
}

impl Machine {
    pub fn for_host(
        host: &Host,
        user: Option<String>,
        ssh: &SshConfig,
    ) -> Self {
        if host.is_local() {
            Self::Local
        } else {
            Self::Ssh {
                user,
                ssh_address: host.ssh_address.clone(),
                key: ssh.key.clone(),
                forward_agent: ssh.forward_agent,
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Ssh { ssh_address, .. } => ssh_address,
            Self::Local => crate::LOCALHOST,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    /// Runs `command` to completion and returns its trimmed stdout.
    pub async fn exec(
        &self,
        command: &RemoteCommand,
    ) -> Result<String, Report> {
        let mut cmd = self.prepare_exec(command, false)?;
        cmd.stdin(Stdio::null());
        let out = cmd.output().await.map_err(|e| ExpError::Connection {
            host: self.name().to_string(),
            reason: e.to_string(),
        })?;
        self.check_status(command, out.status.code(), &out.stderr)?;
        let out = String::from_utf8(out.stdout)
            .wrap_err("output conversion to utf8")?
            .trim()
            .to_string();
        Ok(out)
    }

    /// Starts `command` without waiting for it. Output is appended to
    /// `stdout` and `stderr`, paths on this machine; they may be the same
    /// file.
    pub fn spawn(
        &self,
        name: impl Into<String>,
        command: &RemoteCommand,
        stdout: impl AsRef<Path>,
        stderr: impl AsRef<Path>,
    ) -> Result<ProcessHandle, Report> {
        let name = name.into();
        let (stdout, stderr) = (stdout.as_ref(), stderr.as_ref());
        let mut cmd = match self {
            Self::Local => {
                let mut cmd = self.prepare_exec(command, false)?;
                let out = open_sink(stdout)?;
                let err = if stdout == stderr {
                    out.try_clone().wrap_err("clone output sink")?
                } else {
                    open_sink(stderr)?
                };
                cmd.stdout(out).stderr(err);
                cmd
            }
            Self::Ssh { .. } => {
                // the remote shell writes the sinks; with a forced tty the
                // remote process gets hung up when the local ssh is killed
                let redirect = if stdout == stderr {
                    let stdout = shell_quote(&stdout.to_string_lossy());
                    format!(">> {} 2>&1", stdout)
                } else {
                    format!(
                        ">> {} 2>> {}",
                        shell_quote(&stdout.to_string_lossy()),
                        shell_quote(&stderr.to_string_lossy())
                    )
                };
                let line = format!("{} {}", command.shell_line(), redirect);
                let mut cmd = self.ssh_command(&line, true);
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
                cmd
            }
        };
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        let child = cmd.spawn().map_err(|e| ExpError::Connection {
            host: self.name().to_string(),
            reason: format!("spawn {}: {}", name, e),
        })?;
        tracing::debug!("[{}] spawned {}: {}", self.name(), name, command);
        Ok(ProcessHandle::new(
            name,
            self.name().to_string(),
            command.to_string(),
            child,
            stdout.to_path_buf(),
            stderr.to_path_buf(),
        ))
    }

    pub fn prepare_exec(
        &self,
        command: &RemoteCommand,
        tty: bool,
    ) -> Result<tokio::process::Command, Report> {
        match self {
            Self::Local => {
                let program = command.program().ok_or_else(|| {
                    ExpError::InvalidDefinition("empty command".to_string())
                })?;
                tracing::debug!("{}", command);
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(&command.args[1..]);
                if let Some(cwd) = &command.cwd {
                    cmd.current_dir(cwd);
                }
                cmd.envs(command.env.iter().map(|(k, v)| (k, v)));
                Ok(cmd)
            }
            Self::Ssh { .. } => {
                Ok(self.ssh_command(&command.shell_line(), tty))
            }
        }
    }

    pub async fn mkdir(&self, path: impl AsRef<Path>) -> Result<(), Report> {
        let path = path.as_ref();
        match self {
            Self::Local => tokio::fs::create_dir_all(path)
                .await
                .wrap_err_with(|| format!("mkdir {}", path.display())),
            Self::Ssh { .. } => {
                let command = RemoteCommand::new(crate::args![
                    "mkdir",
                    "-p",
                    path.display()
                ]);
                self.exec(&command).await.map(|_| ())
            }
        }
    }

    pub async fn copy_to(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: impl AsRef<Path>,
    ) -> Result<(), Report> {
        let (from, to) = (local_path.as_ref(), remote_path.as_ref());
        match self {
            Self::Local => Self::local_copy(from, to).await,
            Self::Ssh { .. } => {
                let to = format!("{}:{}", self.target(), to.display());
                self.scp(from.display().to_string(), to).await
            }
        }
    }

    pub async fn copy_from(
        &self,
        remote_path: impl AsRef<Path>,
        local_path: impl AsRef<Path>,
    ) -> Result<(), Report> {
        let (from, to) = (remote_path.as_ref(), local_path.as_ref());
        match self {
            Self::Local => Self::local_copy(from, to).await,
            Self::Ssh { .. } => {
                let from = format!("{}:{}", self.target(), from.display());
                self.scp(from, to.display().to_string()).await
            }
        }
    }

    pub async fn test_connectivity(&self) -> bool {
        self.exec(&RemoteCommand::new(crate::args!["echo"]))
            .await
            .is_ok()
    }

    /// Polls the host every `backoff` until it answers over ssh.
    pub async fn wait_reachable(
        &self,
        timeout: Duration,
        backoff: Duration,
    ) -> Result<(), Report> {
        let poll = async {
            while !self.test_connectivity().await {
                tracing::debug!("{} not reachable yet", self.name());
                tokio::time::sleep(backoff).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.map_err(|_| {
            ExpError::ProvisioningTimeout {
                what: format!("ssh on {}", self.name()),
                secs: timeout.as_secs(),
            }
            .into()
        })
    }

    fn target(&self) -> String {
        match self {
            // machine files may carry the user already
            Self::Ssh {
                user: Some(user),
                ssh_address,
                ..
            } if !ssh_address.contains('@') => {
                format!("{}@{}", user, ssh_address)
            }
            Self::Ssh { ssh_address, .. } => ssh_address.clone(),
            Self::Local => crate::LOCALHOST.to_string(),
        }
    }

    fn ssh_command(&self, line: &str, tty: bool) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args(SSH_OPTIONS);
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", SSH_CONNECT_TIMEOUT_SECS));
        if let Self::Ssh {
            key, forward_agent, ..
        } = self
        {
            if *forward_agent {
                cmd.arg("-A");
            }
            if let Some(key) = key {
                cmd.arg("-i").arg(key);
            }
        }
        if tty {
            cmd.arg("-tt");
        }
        cmd.arg(self.target()).arg(line);
        tracing::debug!("[{}] {}", self.name(), line);
        cmd
    }

    async fn scp(&self, from: String, to: String) -> Result<(), Report> {
        let mut cmd = tokio::process::Command::new("scp");
        cmd.args(SSH_OPTIONS).arg("-r");
        if let Self::Ssh { key: Some(key), .. } = self {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(&from).arg(&to);
        tracing::debug!("scp -r {} {}", from, to);
        let out = cmd.output().await.wrap_err("scp")?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            tracing::warn!("scp {} {} failed: {}", from, to, stderr.trim());
            return Err(ExpError::RemoteCommand {
                host: self.name().to_string(),
                command: format!("scp -r {} {}", from, to),
                code: out.status.code(),
            }
            .into());
        }
        Ok(())
    }

    async fn local_copy(from: &Path, to: &Path) -> Result<(), Report> {
        if from == to {
            return Ok(());
        }
        let status = tokio::process::Command::new("cp")
            .arg("-r")
            .arg(from)
            .arg(to)
            .status()
            .await
            .wrap_err("cp")?;
        if !status.success() {
            tracing::warn!("cp -r {} {} failed", from.display(), to.display());
            return Err(ExpError::RemoteCommand {
                host: crate::LOCALHOST.to_string(),
                command: format!("cp -r {} {}", from.display(), to.display()),
                code: status.code(),
            }
            .into());
        }
        Ok(())
    }

    fn check_status(
        &self,
        command: &RemoteCommand,
        code: Option<i32>,
        stderr: &[u8],
    ) -> Result<(), Report> {
        match code {
            Some(0) => Ok(()),
            Some(SSH_CONNECTION_ERROR) if !self.is_local() => {
                Err(ExpError::Connection {
                    host: self.name().to_string(),
                    reason: String::from_utf8_lossy(stderr).trim().to_string(),
                }
                .into())
            }
            code => {
                let stderr = String::from_utf8_lossy(stderr);
                if !stderr.trim().is_empty() {
                    let (name, stderr) = (self.name(), stderr.trim());
                    tracing::debug!("[{}] stderr: {}", name, stderr);
                }
                Err(ExpError::RemoteCommand {
                    host: self.name().to_string(),
                    command: command.to_string(),
                    code,
                }
                .into())
            }
        }
    }
}
