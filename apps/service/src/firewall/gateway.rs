use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::address::Address;
use super::channel::{ChannelTarget, RemoteChannel, SshChannel};
use super::error::FirewallError;
use crate::config::ChannelConfig;
use crate::database::models::Tenant;

/// Domain operations against one enforcement host.
///
/// Implementations own how remote output is interpreted; callers only see
/// `Ok` or a tagged [`FirewallError`].
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn trust(&self, address: &Address) -> Result<(), FirewallError>;

    /// Succeeds for an address that is already absent remotely.
    async fn untrust(&self, address: &Address) -> Result<(), FirewallError>;

    /// Raw entries of the remote trusted zone, header excluded.
    async fn list_trusted(&self) -> Result<Vec<String>, FirewallError>;
}

/// Hands out a gateway for a resolved tenant.
pub trait FirewallProvider: Send + Sync {
    fn for_tenant(&self, tenant: &Tenant) -> Result<Arc<dyn Firewall>, FirewallError>;
}

/// Gateway speaking the FreePBX `fwconsole firewall` text protocol.
pub struct FwconsoleFirewall<C> {
    channel: Arc<C>,
    target: ChannelTarget,
    command_prefix: String,
    success_marker: String,
}

impl<C: RemoteChannel> FwconsoleFirewall<C> {
    pub fn new(
        channel: Arc<C>,
        target: ChannelTarget,
        command_prefix: impl Into<String>,
        success_marker: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            target,
            command_prefix: command_prefix.into(),
            success_marker: success_marker.into(),
        }
    }

    fn command(&self, args: &str) -> String {
        if self.command_prefix.is_empty() {
            format!("firewall {args}")
        } else {
            format!("{} firewall {args}", self.command_prefix)
        }
    }

    /// Run a command whose success is signalled by the marker in stdout.
    async fn run_marked(&self, command: &str) -> Result<(), FirewallError> {
        let output = self.channel.execute(&self.target, command).await?;
        if output.ok && output.stdout.contains(&self.success_marker) {
            Ok(())
        } else {
            Err(FirewallError::rejected(&self.target.host, command, &output.stdout))
        }
    }
}

/// Header line first, then one entry per line.
pub fn parse_trusted_listing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl<C: RemoteChannel> Firewall for FwconsoleFirewall<C> {
    async fn trust(&self, address: &Address) -> Result<(), FirewallError> {
        let command = self.command(&format!("trust {address}"));
        self.run_marked(&command).await?;
        info!(host = %self.target.host, %address, "Trusted address on firewall");
        Ok(())
    }

    async fn untrust(&self, address: &Address) -> Result<(), FirewallError> {
        let command = self.command(&format!("untrust {address}"));
        match self.run_marked(&command).await {
            Ok(()) => {
                info!(host = %self.target.host, %address, "Untrusted address on firewall");
                Ok(())
            }
            Err(rejected @ FirewallError::RemoteRejected { .. }) => {
                // No marker: the address may simply not be there. Read back before failing.
                let entries = self.list_trusted().await?;
                if entries.iter().any(|entry| address.matches_listing_entry(entry)) {
                    Err(rejected)
                } else {
                    debug!(host = %self.target.host, %address, "Address already absent from firewall");
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn list_trusted(&self) -> Result<Vec<String>, FirewallError> {
        let command = self.command("list trusted");
        let output = self.channel.execute(&self.target, &command).await?;
        if !output.ok {
            return Err(FirewallError::rejected(&self.target.host, command, &output.stdout));
        }
        Ok(parse_trusted_listing(&output.stdout))
    }
}

/// Builds ssh-backed gateways from the channel configuration.
pub struct SshFirewallProvider {
    channel: Arc<SshChannel>,
    command_prefix: String,
    success_marker: String,
}

impl SshFirewallProvider {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            channel: Arc::new(SshChannel::new(config.ssh_binary.clone(), config.timeout())),
            command_prefix: config.command_prefix.clone(),
            success_marker: config.success_marker.clone(),
        }
    }
}

impl FirewallProvider for SshFirewallProvider {
    fn for_tenant(&self, tenant: &Tenant) -> Result<Arc<dyn Firewall>, FirewallError> {
        let target = ChannelTarget::from_tenant(tenant)?;
        Ok(Arc::new(FwconsoleFirewall::new(
            Arc::clone(&self.channel),
            target,
            self.command_prefix.clone(),
            self.success_marker.clone(),
        )))
    }
}
