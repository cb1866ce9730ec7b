// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Pluggable authentication of CONNECT requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, ErrorKind};

mod accept_all;
mod file_auth;

pub use accept_all::AcceptAllAuthService;
pub use file_auth::FileAuthService;

/// Decides whether a CONNECT request is allowed.
pub trait AuthService: Send + Sync {
    /// Returns true if the client is allowed to connect.
    ///
    /// `username` and `password` are taken from the CONNECT packet payload
    /// and are absent if the matching connect flag is unset.
    fn authenticate(
        &self,
        remote_addr: SocketAddr,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool;
}

/// Builds an authentication service instance from the full config.
pub type AuthServiceFactory = fn(&Config) -> Result<Arc<dyn AuthService>, Error>;

pub const ACCEPT_ALL: &str = "accept_all";
pub const PASSWORD_FILE: &str = "password_file";

fn factories_by_name() -> HashMap<&'static str, AuthServiceFactory> {
    let mut factories: HashMap<&'static str, AuthServiceFactory> = HashMap::new();
    factories.insert(ACCEPT_ALL, accept_all::new_auth_service);
    factories.insert(PASSWORD_FILE, file_auth::new_auth_service);
    factories
}

/// Resolve the authentication service factory named in the config and build
/// the service.
///
/// # Errors
///
/// Returns error if no factory with that name is registered, or the factory
/// fails to build its service.
pub fn new_auth_service(config: &Config) -> Result<Arc<dyn AuthService>, Error> {
    let name = config.security().auth_service();
    match factories_by_name().get(name) {
        Some(factory) => factory(config),
        None => Err(Error::from_string(
            ErrorKind::ConfigError,
            format!("auth: No auth service factory named {name:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_factory_is_registered() {
        let config = Config::default();
        assert_eq!(config.security().auth_service(), ACCEPT_ALL);
        assert!(new_auth_service(&config).is_ok());
    }
}
