// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use super::AuthService;
use crate::config::Config;
use crate::error::{Error, ErrorKind};

/// Checks credentials against a password file.
///
/// Each line in the file is a `username:password` pair. Empty lines and
/// lines starting with `#` are ignored.
#[derive(Debug, Clone)]
pub struct FileAuthService {
    users: HashMap<String, String>,
}

impl FileAuthService {
    /// Load users from `passwd_file`.
    ///
    /// # Errors
    ///
    /// Returns error if the file is not readable or contains invalid lines.
    pub fn load<P: AsRef<Path>>(passwd_file: P) -> Result<Self, Error> {
        let fd = File::open(passwd_file.as_ref())?;
        let reader = BufReader::new(fd);
        let mut users = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(':') {
                Some((username, password)) => {
                    users.insert(username.to_string(), password.to_string());
                }
                None => {
                    return Err(Error::from_string(
                        ErrorKind::ConfigError,
                        format!("auth: Invalid password file line: {line:?}"),
                    ));
                }
            }
        }
        Ok(Self { users })
    }
}

impl AuthService for FileAuthService {
    fn authenticate(
        &self,
        _remote_addr: SocketAddr,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        let (Some(username), Some(password)) = (username, password) else {
            return false;
        };
        match self.users.get(username) {
            Some(expected) => expected.as_bytes() == password,
            None => false,
        }
    }
}

pub fn new_auth_service(config: &Config) -> Result<Arc<dyn AuthService>, Error> {
    let Some(passwd_file) = config.security().password_file() else {
        return Err(Error::new(
            ErrorKind::ConfigError,
            "auth: password_file auth service requires a password_file path",
        ));
    };
    Ok(Arc::new(FileAuthService::load(passwd_file)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn addr() -> SocketAddr {
        "127.0.0.1:1883".parse().unwrap()
    }

    #[test]
    fn test_authenticate() {
        let path = std::env::temp_dir().join("tern-tests-passwd");
        let mut fd = File::create(&path).unwrap();
        writeln!(fd, "# comment").unwrap();
        writeln!(fd, "alice:wonderland").unwrap();
        writeln!(fd).unwrap();
        writeln!(fd, "bob:builder").unwrap();
        drop(fd);

        let service = FileAuthService::load(&path).unwrap();
        assert!(service.authenticate(addr(), Some("alice"), Some(b"wonderland")));
        assert!(service.authenticate(addr(), Some("bob"), Some(b"builder")));
        assert!(!service.authenticate(addr(), Some("alice"), Some(b"builder")));
        assert!(!service.authenticate(addr(), Some("mallory"), Some(b"x")));
        assert!(!service.authenticate(addr(), Some("alice"), None));
        assert!(!service.authenticate(addr(), None, None));
    }
}
