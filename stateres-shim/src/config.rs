// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration of the shim service.
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use stateres_core::RoomVersion;

/// Default port the service listens on.
pub const DEFAULT_BIND_PORT: u16 = 1234;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONCURRENT_RESOLUTIONS: usize = 128;
const OUTBOUND_BUFFER: usize = 256;

/// Configuration parameters of the shim.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address of the listening socket.
    ///
    /// Default: 0.0.0.0:1234.
    pub(crate) bind_addr: SocketAddr,

    /// Maximum time to wait for the remote to answer a single `get_event` request.
    ///
    /// Default: 30 seconds.
    pub(crate) fetch_timeout: Duration,

    /// Maximum number of resolution tasks running at the same time on one connection. Further
    /// requests wait until a running task finished.
    ///
    /// Default: 128.
    pub(crate) max_concurrent_resolutions: usize,

    /// Room version assumed when a request names a version we don't know.
    ///
    /// Default: 10.
    pub(crate) default_room_version: RoomVersion,

    /// Reject fetched events whose content doesn't hash to the requested event id.
    ///
    /// Default: false.
    pub(crate) verify_event_ids: bool,

    /// Capacity of the per-connection queue of outbound messages.
    ///
    /// Default: 256.
    pub(crate) outbound_buffer: usize,
}

impl Config {
    /// Return a default instance of `Config`.
    pub fn new() -> Self {
        Default::default()
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Define the maximum number of concurrently running resolution tasks per connection.
    ///
    /// At least one task is always allowed to run.
    pub fn max_concurrent_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_resolutions = max.max(1);
        self
    }

    pub fn default_room_version(mut self, room_version: RoomVersion) -> Self {
        self.default_room_version = room_version;
        self
    }

    pub fn verify_event_ids(mut self, verify: bool) -> Self {
        self.verify_event_ids = verify;
        self
    }

    pub fn outbound_buffer(mut self, capacity: usize) -> Self {
        self.outbound_buffer = capacity.max(1);
        self
    }

    pub fn get_bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn get_fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                DEFAULT_BIND_PORT,
            )),
            fetch_timeout: FETCH_TIMEOUT,
            max_concurrent_resolutions: MAX_CONCURRENT_RESOLUTIONS,
            default_room_version: RoomVersion::V10,
            verify_event_ids: false,
            outbound_buffer: OUTBOUND_BUFFER,
        }
    }
}
