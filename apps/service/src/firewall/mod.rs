/// Firewall gateway layer
///
/// Translates trust/untrust/list operations into fixed-form commands sent over
/// a short-lived remote channel to one enforcement host per tenant.

pub mod address;
pub mod channel;
pub mod error;
pub mod gateway;

pub use address::Address;
pub use error::{FirewallError, FirewallErrorKind};
pub use gateway::{Firewall, FirewallProvider, SshFirewallProvider};
