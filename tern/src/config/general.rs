// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, ErrorKind};

/// General section of the config.
#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// Address to bind, `ip:port` pair.
    ///
    /// Default is `0.0.0.0:1883`.
    #[serde(default = "General::default_address")]
    address: String,

    /// Milliseconds before a silent connection without a CONNECT packet is
    /// closed.
    ///
    /// Default is 10000.
    #[serde(default = "General::default_connect_timeout")]
    connect_timeout: u64,

    /// Initial read buffer size of a connection, in bytes.
    ///
    /// Default is 256.
    #[serde(default = "General::default_read_buffer_size")]
    read_buffer_size: usize,

    /// Initial write buffer size of a connection, in bytes.
    ///
    /// Default is 256.
    #[serde(default = "General::default_write_buffer_size")]
    write_buffer_size: usize,

    /// Milliseconds before an unacknowledged PUBLISH or PUBREL packet is
    /// retransmitted.
    ///
    /// Default is 2000.
    #[serde(default = "General::default_pub_ack_timeout")]
    pub_ack_timeout: u64,

    /// Number of retransmissions before an in-flight publication is
    /// abandoned and its packet id released.
    ///
    /// Default is 3.
    #[serde(default = "General::default_pub_max_retries")]
    pub_max_retries: usize,
}

impl General {
    fn default_address() -> String {
        "0.0.0.0:1883".to_string()
    }

    const fn default_connect_timeout() -> u64 {
        10_000
    }

    const fn default_read_buffer_size() -> usize {
        256
    }

    const fn default_write_buffer_size() -> usize {
        256
    }

    const fn default_pub_ack_timeout() -> u64 {
        2_000
    }

    const fn default_pub_max_retries() -> usize {
        3
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    #[must_use]
    pub const fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    #[must_use]
    pub const fn write_buffer_size(&self) -> usize {
        self.write_buffer_size
    }

    #[must_use]
    pub const fn pub_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.pub_ack_timeout)
    }

    #[must_use]
    pub const fn pub_max_retries(&self) -> usize {
        self.pub_max_retries
    }

    /// Validate config options.
    ///
    /// # Errors
    ///
    /// Returns error if `address` is not a valid socket address.
    pub fn validate(&self) -> Result<(), Error> {
        if self.address.parse::<SocketAddr>().is_err() {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("config: Invalid server address: {}", self.address),
            ));
        }
        Ok(())
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
            connect_timeout: Self::default_connect_timeout(),
            read_buffer_size: Self::default_read_buffer_size(),
            write_buffer_size: Self::default_write_buffer_size(),
            pub_ack_timeout: Self::default_pub_ack_timeout(),
            pub_max_retries: Self::default_pub_max_retries(),
        }
    }
}
