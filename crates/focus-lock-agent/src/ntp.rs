//! SNTP offset probe.
//!
//! Used once at session arm to detect wall-clock manipulation. Servers are
//! tried in order and the first answer wins; a total miss downgrades the
//! time oracle into the usage-based countdown.

use std::time::Duration;

use rsntp::SntpClient;
use tracing::debug;

use focus_lock_common::{Error, Result};

pub const NTP_SERVERS: &[&str] = &["pool.ntp.org", "time.google.com", "time.windows.com"];

const PER_SERVER_TIMEOUT: Duration = Duration::from_secs(2);

/// Offset between network time and the system clock. Positive means the
/// system clock runs behind the network.
pub fn clock_offset() -> Result<chrono::Duration> {
    let mut client = SntpClient::new();
    client.set_timeout(PER_SERVER_TIMEOUT);

    for server in NTP_SERVERS {
        match client.synchronize(server) {
            Ok(result) => {
                let offset_ms = (result.clock_offset().as_secs_f64() * 1000.0).round() as i64;
                debug!("NTP offset from {server}: {offset_ms} ms");
                return Ok(chrono::Duration::milliseconds(offset_ms));
            }
            Err(err) => debug!("NTP server {server} failed: {err}"),
        }
    }
    Err(Error::NetTime)
}
