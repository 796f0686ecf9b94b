//! Remote executor over `ssh`.
//!
//! Each call spawns one `ssh` child that runs the configured script on the
//! managed host. The child is killed if the caller's timeout drops the future;
//! the remote side may still complete, which the idempotent scripts tolerate.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use provisioning_sdk::{ExecutorError, RemoteExecutor, Username};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::SshConfig;

/// ssh itself failed (connection refused, auth, host unreachable).
const EXIT_SSH_TRANSPORT: i32 = 255;
/// `EX_TEMPFAIL` from sysexits.h; scripts use it for "try again later".
const EXIT_TEMPFAIL: i32 = 75;

const STDERR_TAIL_BYTES: usize = 512;

#[derive(Debug, Clone)]
pub struct SshExecutor {
    program: PathBuf,
    config: SshConfig,
}

impl SshExecutor {
    #[must_use]
    pub fn new(config: SshConfig) -> Self {
        Self {
            program: PathBuf::from("ssh"),
            config,
        }
    }

    /// Use a different client binary instead of `ssh` from `PATH`.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn ssh_args(&self) -> Vec<String> {
        let cfg = &self.config;
        let mut args = Vec::with_capacity(12 + cfg.options.len() * 2);

        if let Some(identity) = &cfg.identity_file {
            args.push("-i".to_owned());
            args.push(identity.display().to_string());
        }
        args.push("-p".to_owned());
        args.push(cfg.port.to_string());
        args.push("-o".to_owned());
        args.push("BatchMode=yes".to_owned());
        args.push("-o".to_owned());
        args.push(format!("ConnectTimeout={}", cfg.connect_timeout.as_secs().max(1)));
        for opt in &cfg.options {
            args.push("-o".to_owned());
            args.push(opt.clone());
        }
        args.push(format!("{}@{}", cfg.user, cfg.host));
        args
    }

    async fn run_remote(&self, op: &'static str, remote: &[String]) -> Result<(), ExecutorError> {
        debug!(op, host = %self.config.host, command = %remote.join(" "), "running remote command");

        let output = Command::new(&self.program)
            .args(self.ssh_args())
            .arg("--")
            .args(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ExecutorError::permanent(format!(
                    "{op}: failed to spawn {}: {e}",
                    self.program.display()
                ))
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = stderr_tail(&output.stderr);
        let code = output.status.code();
        warn!(op, host = %self.config.host, exit_code = ?code, stderr = %stderr, "remote command failed");

        Err(classify_exit(op, code, &stderr))
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn bring_up(&self, username: &Username, port: u16) -> Result<(), ExecutorError> {
        let remote = [
            self.config.bring_up_command.clone(),
            username.to_string(),
            port.to_string(),
        ];
        self.run_remote("bring_up", &remote).await
    }

    async fn tear_down(&self, username: &Username) -> Result<(), ExecutorError> {
        let remote = [self.config.tear_down_command.clone(), username.to_string()];
        self.run_remote("tear_down", &remote).await
    }
}

fn classify_exit(op: &str, code: Option<i32>, stderr: &str) -> ExecutorError {
    match code {
        Some(EXIT_SSH_TRANSPORT) => {
            ExecutorError::transient(format!("{op}: ssh connection failed: {stderr}"))
        }
        Some(EXIT_TEMPFAIL) => {
            ExecutorError::transient(format!("{op}: remote asked to retry later: {stderr}"))
        }
        Some(code) => ExecutorError::permanent(format!("{op}: exited with {code}: {stderr}")),
        None => ExecutorError::transient(format!("{op}: ssh terminated by signal: {stderr}")),
    }
}

fn stderr_tail(raw: &[u8]) -> String {
    let start = raw.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&raw[start..]).trim().to_owned()
}
