//! Process-wide tracing setup shared by the trustgate binaries.

mod subscriber;

pub use subscriber::{init, init_with_level};
