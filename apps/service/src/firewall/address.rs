//! Strict address grammar for anything interpolated into a remote command.
//!
//! Accepts a bare IPv4/IPv6 address or one with a `/prefix` suffix. The
//! accepted value is re-rendered from the parsed form, so the text that reaches
//! the remote shell never contains anything but digits, hex, `.`, `:` and `/`.
//! A full-length prefix (`/32`, `/128`) names a single host and is dropped, so
//! both spellings of one host share a single canonical form.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_ADDRESS_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("address is too long ({0} bytes)")]
    TooLong(usize),
    #[error("'{0}' is not an IP address")]
    NotAnIp(String),
    #[error("invalid prefix length '{prefix}' for {ip}")]
    InvalidPrefix { ip: IpAddr, prefix: String },
}

/// A validated network address, optionally with a prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    ip: IpAddr,
    prefix: Option<u8>,
}

impl Address {
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        if trimmed.len() > MAX_ADDRESS_LEN {
            return Err(AddressError::TooLong(trimmed.len()));
        }

        let (ip_part, prefix_part) = match trimmed.split_once('/') {
            Some((ip, prefix)) => (ip, Some(prefix)),
            None => (trimmed, None),
        };

        let ip: IpAddr =
            ip_part.parse().map_err(|_| AddressError::NotAnIp(ip_part.to_string()))?;

        let prefix = match prefix_part {
            None => None,
            Some(raw_prefix) => {
                let max = if ip.is_ipv4() { 32 } else { 128 };
                let invalid =
                    || AddressError::InvalidPrefix { ip, prefix: raw_prefix.to_string() };
                if raw_prefix.is_empty() || !raw_prefix.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                let value: u8 = raw_prefix.parse().map_err(|_| invalid())?;
                if value > max {
                    return Err(invalid());
                }
                (value < max).then_some(value)
            }
        };

        Ok(Self { ip, prefix })
    }

    /// True when `entry` from a remote listing names this address.
    pub fn matches_listing_entry(&self, entry: &str) -> bool {
        match Address::parse(entry) {
            Ok(other) => other == *self,
            Err(_) => false,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.prefix {
            Some(prefix) => write!(f, "{}/{}", self.ip, prefix),
            None => write!(f, "{}", self.ip),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}
