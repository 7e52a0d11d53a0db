//! Tunable timeouts and window sizes.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
use std::time::Duration;

/// Every timeout and window-size setting named in the transport's public
/// interface, collected into one struct instead of a parade of setters —
/// idiomatic in Rust, and functionally equivalent to calling every setter
/// once right after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// How long a slave waits for a `CONNECTION` reply before resending its
    /// own burst.
    pub connection_wait_timeout: Duration,
    /// How long a slave waits for any datagram from the master before
    /// emitting a keepalive `PING`.
    pub ping_timeout: Duration,
    /// Consecutive silent `ping_timeout` intervals a slave tolerates before
    /// raising [`Error::Communication`](crate::Error::Communication).
    /// Clamped to at least 2.
    pub max_ping_requests: u32,
    /// How long `receive` waits on an empty delivery queue before nudging
    /// the master with a nudge-loss report.
    pub receive_wait_timeout: Duration,
    /// Retransmit interval for barrier/gather/pipe-creation bursts.
    pub barrier_wait_timeout: Duration,
    /// Master's per-pipe send window, in packets.
    pub send_buffer_size: usize,
    /// Duplicate copies of each control datagram the master emits.
    pub master_message_burst_size: u32,
    /// Duplicate copies of each control datagram a slave emits.
    pub slave_message_burst_size: u32,
}

impl Config {
    /// Clamp [`Config::max_ping_requests`] to the documented minimum of 2,
    /// the same clamp the original implementation applies in its setter.
    pub fn clamped(mut self) -> Self {
        if self.max_ping_requests < 2 {
            self.max_ping_requests = 2;
        }
        if self.master_message_burst_size == 0 {
            self.master_message_burst_size = 1;
        }
        if self.slave_message_burst_size == 0 {
            self.slave_message_burst_size = 1;
        }
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_wait_timeout: Duration::from_millis(500),
            ping_timeout: Duration::from_secs(10),
            max_ping_requests: 3,
            receive_wait_timeout: Duration::from_millis(250),
            barrier_wait_timeout: Duration::from_millis(100),
            send_buffer_size: 20,
            master_message_burst_size: 1,
            slave_message_burst_size: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.connection_wait_timeout, Duration::from_millis(500));
        assert_eq!(cfg.ping_timeout, Duration::from_secs(10));
        assert_eq!(cfg.max_ping_requests, 3);
        assert_eq!(cfg.receive_wait_timeout, Duration::from_millis(250));
        assert_eq!(cfg.barrier_wait_timeout, Duration::from_millis(100));
        assert_eq!(cfg.send_buffer_size, 20);
        assert_eq!(cfg.master_message_burst_size, 1);
        assert_eq!(cfg.slave_message_burst_size, 1);
    }

    #[test]
    fn clamps_max_ping_requests() {
        let cfg = Config {
            max_ping_requests: 1,
            ..Config::default()
        }
        .clamped();
        assert_eq!(cfg.max_ping_requests, 2);
    }

    #[test]
    fn clamps_zero_burst_sizes_to_one() {
        let cfg = Config {
            master_message_burst_size: 0,
            slave_message_burst_size: 0,
            ..Config::default()
        }
        .clamped();
        assert_eq!(cfg.master_message_burst_size, 1);
        assert_eq!(cfg.slave_message_burst_size, 1);
    }
}
