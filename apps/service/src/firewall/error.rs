use std::fmt;

use thiserror::Error;

/// Which side of the remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallErrorKind {
    /// Host unreachable, channel authentication failed or the call timed out.
    Connection,
    /// The command ran but did not report success.
    RemoteRejected,
}

impl fmt::Display for FirewallErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallErrorKind::Connection => write!(f, "connection"),
            FirewallErrorKind::RemoteRejected => write!(f, "remote-rejected"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum FirewallError {
    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },
    #[error("{host} rejected `{command}`: {output}")]
    RemoteRejected { host: String, command: String, output: String },
}

impl FirewallError {
    pub fn connection(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connection { host: host.into(), reason: reason.into() }
    }

    pub fn rejected(
        host: impl Into<String>,
        command: impl Into<String>,
        output: impl AsRef<str>,
    ) -> Self {
        Self::RemoteRejected {
            host: host.into(),
            command: command.into(),
            output: summarize_output(output.as_ref()),
        }
    }

    pub fn kind(&self) -> FirewallErrorKind {
        match self {
            FirewallError::Connection { .. } => FirewallErrorKind::Connection,
            FirewallError::RemoteRejected { .. } => FirewallErrorKind::RemoteRejected,
        }
    }
}

/// Collapse remote output into a single bounded line for error messages.
fn summarize_output(output: &str) -> String {
    const MAX_CHARS: usize = 200;

    let joined = output.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        return "<no output>".to_string();
    }
    if joined.chars().count() > MAX_CHARS {
        let truncated: String = joined.chars().take(MAX_CHARS).collect();
        format!("{truncated}...")
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(
            FirewallError::connection("pbx", "timed out").kind(),
            FirewallErrorKind::Connection
        );
        assert_eq!(
            FirewallError::rejected("pbx", "fwconsole firewall trust 10.0.0.5", "Error").kind(),
            FirewallErrorKind::RemoteRejected
        );
        assert_eq!(FirewallErrorKind::RemoteRejected.to_string(), "remote-rejected");
    }

    #[test]
    fn test_rejected_output_is_summarized() {
        let error = FirewallError::rejected("pbx", "cmd", "line one\n\n  line two\n");
        assert_eq!(error.to_string(), "pbx rejected `cmd`: line one line two");

        let error = FirewallError::rejected("pbx", "cmd", "");
        assert!(error.to_string().ends_with("<no output>"));

        let error = FirewallError::rejected("pbx", "cmd", "x".repeat(500));
        assert!(error.to_string().ends_with("..."));
    }
}
