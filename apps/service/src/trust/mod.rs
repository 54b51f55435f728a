/// Trust-state lifecycle
///
/// - `registry`: caller → tenant resolution, with an optional fallback tenant
/// - `service`: trust / revoke / live check, remote first then local
/// - `sweeper`: periodic untrust and removal of expired records
/// - `clock`: injectable wall clock for expiry arithmetic

pub mod clock;
pub mod registry;
pub mod service;
pub mod sweeper;


pub use clock::{Clock, SystemClock};
pub use registry::TenantRegistry;
pub use service::TrustService;
pub use sweeper::Sweeper;
