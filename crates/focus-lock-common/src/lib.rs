pub mod error;
pub mod schedule;
pub mod types;
pub mod vpn;

pub use error::{Error, Result};
pub use schedule::is_active;
pub use types::{Config, Schedule, Stats, EMERGENCY_UNLOCK_LIMIT, EMERGENCY_UNLOCK_PAUSE};
