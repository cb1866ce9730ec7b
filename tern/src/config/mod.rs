// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Deserialize;

use crate::error::Error;

mod general;
mod log;
mod security;

pub use self::log::{Log, LogLevel};
pub use general::General;
pub use security::Security;

/// Server main config.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "General::default")]
    general: General,

    #[serde(default = "Security::default")]
    security: Security,

    #[serde(default = "Log::default")]
    log: Log,
}

impl Config {
    #[must_use]
    pub const fn general(&self) -> &General {
        &self.general
    }

    #[must_use]
    pub const fn security(&self) -> &Security {
        &self.security
    }

    #[must_use]
    pub const fn log(&self) -> &Log {
        &self.log
    }

    /// Validate config.
    ///
    /// # Errors
    ///
    /// Returns error if some options in config are invalid.
    pub fn validate(&self) -> Result<(), Error> {
        self.general.validate()?;
        self.security.validate()
    }
}
