//! Connect probe for external callers that must not start until the
//! gateway is accepting connections.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tracing::debug;

pub const DEFAULT_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Try to open a TCP connection to the gateway, retrying with exponential
/// backoff: `initial_delay` between the first retry pair, doubling after
/// each failure, capped at `attempts` tries. Returns true once a connection
/// succeeds.
pub fn wait_for_gateway(addr: SocketAddr, attempts: u32, initial_delay: Duration) -> bool {
    let mut delay = initial_delay;
    for attempt in 1..=attempts.max(1) {
        match TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
            Ok(_) => return true,
            Err(err) => {
                debug!(%addr, attempt, ?err, "gateway probe failed");
            }
        }
        if attempt < attempts {
            std::thread::sleep(delay);
            delay *= 2;
        }
    }
    false
}

/// Probe with the documented client defaults: 2s initial delay, doubling,
/// five attempts.
pub fn probe(addr: SocketAddr) -> bool {
    wait_for_gateway(addr, DEFAULT_ATTEMPTS, DEFAULT_INITIAL_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn probe_succeeds_against_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(wait_for_gateway(addr, 1, Duration::from_millis(1)));
    }

    #[test]
    fn probe_gives_up_after_capped_attempts() {
        // Bind then drop to get an address nothing is listening on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        assert!(!wait_for_gateway(addr, 2, Duration::from_millis(1)));
    }
}
