//! Remote command channel: one fresh ssh session per command.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::error::FirewallError;
use crate::database::models::Tenant;

/// ssh reserves this exit status for its own failures (connect, auth, config).
const SSH_FAILURE_STATUS: i32 = 255;

/// Where and as whom a command is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    pub host: String,
    pub user: String,
    pub credential: String,
}

impl ChannelTarget {
    pub fn from_tenant(tenant: &Tenant) -> Result<Self, FirewallError> {
        let host = normalize_host(&tenant.host);
        if host.is_empty() || host.starts_with('-') || host.contains(char::is_whitespace) {
            return Err(FirewallError::connection(
                tenant.host.clone(),
                format!("invalid host for tenant '{}'", tenant.name),
            ));
        }
        if tenant.channel_user.starts_with('-') || tenant.channel_user.contains(char::is_whitespace)
        {
            return Err(FirewallError::connection(
                host,
                format!("invalid channel user for tenant '{}'", tenant.name),
            ));
        }

        Ok(Self {
            host,
            user: tenant.channel_user.clone(),
            credential: tenant.credential_reference.clone(),
        })
    }
}

/// Hosts are sometimes stored as URLs; the channel only wants the host part.
fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_string()
}

/// Raw result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    /// Whether the remote command exited successfully.
    pub ok: bool,
}

/// Executes a single command on an enforcement host.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    async fn execute(
        &self,
        target: &ChannelTarget,
        command: &str,
    ) -> Result<CommandOutput, FirewallError>;
}

/// Channel backed by the system `ssh` client in batch mode.
#[derive(Debug, Clone)]
pub struct SshChannel {
    ssh_binary: String,
    timeout: Duration,
}

impl SshChannel {
    pub fn new(ssh_binary: impl Into<String>, timeout: Duration) -> Self {
        Self { ssh_binary: ssh_binary.into(), timeout }
    }

    fn build_command(&self, target: &ChannelTarget, command: &str) -> Command {
        let connect_timeout = self.timeout.as_secs().max(1);

        let mut cmd = Command::new(&self.ssh_binary);
        cmd.arg("-T")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={connect_timeout}"));
        if !target.credential.is_empty() {
            cmd.arg("-i").arg(&target.credential);
        }
        if !target.user.is_empty() {
            cmd.arg("-l").arg(&target.user);
        }
        cmd.arg("--").arg(&target.host).arg(command);

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn execute(
        &self,
        target: &ChannelTarget,
        command: &str,
    ) -> Result<CommandOutput, FirewallError> {
        debug!(host = %target.host, command, "Executing remote command");

        let child = self
            .build_command(target, command)
            .spawn()
            .map_err(|e| FirewallError::connection(&target.host, format!("failed to spawn ssh: {e}")))?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(FirewallError::connection(
                    &target.host,
                    format!("failed to wait for ssh: {e}"),
                ));
            }
            Err(_) => {
                warn!(host = %target.host, command, "Remote command timed out");
                return Err(FirewallError::connection(
                    &target.host,
                    format!("timed out after {}s", self.timeout.as_secs_f32()),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if output.status.code() == Some(SSH_FAILURE_STATUS) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FirewallError::connection(&target.host, stderr.trim().to_string()));
        }

        if output.status.code().is_none() {
            return Err(FirewallError::connection(&target.host, "ssh terminated by signal"));
        }

        Ok(CommandOutput { stdout, ok: output.status.success() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(host: &str) -> Tenant {
        Tenant {
            id: Some(1),
            name: "pbx".into(),
            host: host.into(),
            channel_user: "root".into(),
            credential_reference: "/keys/pbx".into(),
        }
    }

    #[test]
    fn test_target_strips_scheme() {
        let target = ChannelTarget::from_tenant(&tenant("https://pbx.example.net/")).unwrap();
        assert_eq!(target.host, "pbx.example.net");
        assert_eq!(target.user, "root");

        let target = ChannelTarget::from_tenant(&tenant("http://10.1.1.1")).unwrap();
        assert_eq!(target.host, "10.1.1.1");
    }

    #[test]
    fn test_target_rejects_option_like_hosts() {
        assert!(ChannelTarget::from_tenant(&tenant("-oProxyCommand=evil")).is_err());
        assert!(ChannelTarget::from_tenant(&tenant("pbx host")).is_err());
        assert!(ChannelTarget::from_tenant(&tenant("")).is_err());
    }

    #[cfg(unix)]
    mod fake_ssh {
        use super::*;
        use crate::firewall::FirewallErrorKind;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn script(dir: &TempDir, body: &str) -> String {
            let path = dir.path().join("fake-ssh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        fn target() -> ChannelTarget {
            ChannelTarget::from_tenant(&tenant("pbx.example.net")).unwrap()
        }

        #[tokio::test]
        async fn test_passes_command_as_last_argument() {
            let dir = TempDir::new().unwrap();
            let channel = SshChannel::new(script(&dir, "echo \"$@\""), Duration::from_secs(5));

            let output = channel.execute(&target(), "fwconsole firewall list trusted").await.unwrap();
            assert!(output.ok);
            assert!(output.stdout.contains("-i /keys/pbx"));
            assert!(output.stdout.contains("-l root"));
            assert!(output.stdout.trim_end().ends_with("-- pbx.example.net fwconsole firewall list trusted"));
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_not_a_connection_failure() {
            let dir = TempDir::new().unwrap();
            let channel = SshChannel::new(script(&dir, "echo 'Error: nope'\nexit 1"), Duration::from_secs(5));

            let output = channel.execute(&target(), "fwconsole firewall trust 10.0.0.5").await.unwrap();
            assert!(!output.ok);
            assert_eq!(output.stdout.trim(), "Error: nope");
        }

        #[tokio::test]
        async fn test_exit_255_is_connection_failure() {
            let dir = TempDir::new().unwrap();
            let channel = SshChannel::new(
                script(&dir, "echo 'Permission denied (publickey).' >&2\nexit 255"),
                Duration::from_secs(5),
            );

            let error = channel.execute(&target(), "true").await.unwrap_err();
            assert_eq!(error.kind(), FirewallErrorKind::Connection);
            assert!(error.to_string().contains("Permission denied"));
        }

        #[tokio::test]
        async fn test_hung_host_times_out() {
            let dir = TempDir::new().unwrap();
            let channel = SshChannel::new(script(&dir, "sleep 5"), Duration::from_millis(200));

            let error = channel.execute(&target(), "true").await.unwrap_err();
            assert_eq!(error.kind(), FirewallErrorKind::Connection);
            assert!(error.to_string().contains("timed out"));
        }

        #[tokio::test]
        async fn test_missing_binary_is_connection_failure() {
            let channel = SshChannel::new("/nonexistent/trustgate-ssh", Duration::from_secs(1));
            let error = channel.execute(&target(), "true").await.unwrap_err();
            assert_eq!(error.kind(), FirewallErrorKind::Connection);
        }
    }
}
