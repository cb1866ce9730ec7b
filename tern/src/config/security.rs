// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind};

/// Security section of the config.
#[derive(Debug, Clone, Deserialize)]
pub struct Security {
    /// Name of the authentication service factory to use.
    ///
    /// Default is `accept_all`.
    #[serde(default = "Security::default_auth_service")]
    auth_service: String,

    /// Path to the password file consumed by the `password_file`
    /// authentication service. Each line is a `username:password` pair,
    /// empty lines and lines starting with `#` are ignored.
    #[serde(default)]
    password_file: Option<PathBuf>,
}

impl Security {
    fn default_auth_service() -> String {
        "accept_all".to_string()
    }

    #[must_use]
    pub fn auth_service(&self) -> &str {
        &self.auth_service
    }

    #[must_use]
    pub fn password_file(&self) -> Option<&Path> {
        self.password_file.as_deref()
    }

    /// Validate config options.
    ///
    /// # Errors
    ///
    /// Returns error if the selected authentication service requires options
    /// which are not set.
    pub fn validate(&self) -> Result<(), Error> {
        if self.auth_service == "password_file" && self.password_file.is_none() {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "config: password_file auth service requires a password_file path",
            ));
        }
        Ok(())
    }
}

impl Default for Security {
    fn default() -> Self {
        Self {
            auth_service: Self::default_auth_service(),
            password_file: None,
        }
    }
}
