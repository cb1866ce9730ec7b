// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;
use tokio::sync::mpsc;

use crate::commands::{ConnectionToDispatcherCmd, DispatcherToConnectionCmd};

/// Represent the types of errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Error occurred while performing I/O.
    IoError,

    /// Packet encode error.
    EncodeError,

    /// Packet decode error.
    DecodeError,

    /// Send packet error.
    SendError,

    /// Socket stream error.
    SocketError,

    /// Invalid config file or config options.
    ConfigError,

    /// Failed to init logger module.
    LoggerError,

    /// Invalid command line parameters.
    ParameterError,

    /// Client violated the protocol, its connection is closed.
    ProtocolViolation,

    /// Session with client id not found.
    SessionNotFound,

    /// mpsc channel error.
    ChannelError,
}

#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub const fn from_string(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn session_error(client_id: &str) -> Self {
        Self::from_string(
            ErrorKind::SessionNotFound,
            format!("Session with client id {client_id} not found"),
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_string(ErrorKind::IoError, format!("IoError {err}"))
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::from_string(ErrorKind::EncodeError, format!("{err:?}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::from_string(ErrorKind::DecodeError, format!("{err:?}"))
    }
}

macro_rules! convert_send_error {
    ($cmd_type: ident) => {
        impl From<mpsc::error::SendError<$cmd_type>> for Error {
            fn from(err: mpsc::error::SendError<$cmd_type>) -> Self {
                Self::from_string(
                    ErrorKind::ChannelError,
                    format!("{} channel error: {}", stringify!($cmd_type), err),
                )
            }
        }
    };
}

convert_send_error!(ConnectionToDispatcherCmd);
convert_send_error!(DispatcherToConnectionCmd);
