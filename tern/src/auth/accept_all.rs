// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::net::SocketAddr;
use std::sync::Arc;

use super::AuthService;
use crate::config::Config;
use crate::error::Error;

/// Grants every CONNECT request, credentials or not.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllAuthService {}

impl AuthService for AcceptAllAuthService {
    fn authenticate(
        &self,
        _remote_addr: SocketAddr,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> bool {
        true
    }
}

pub fn new_auth_service(_config: &Config) -> Result<Arc<dyn AuthService>, Error> {
    Ok(Arc::new(AcceptAllAuthService {}))
}
