pub mod enforcer;
pub mod ghost;
pub mod hosts;
pub mod ntp;
pub mod protection;
pub mod session;
pub mod time_oracle;

pub use enforcer::{Cadence, Enforcer};
pub use session::SessionControl;
pub use time_oracle::{Deadline, SessionClock};
