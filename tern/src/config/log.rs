// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Log level of server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log section of the config.
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    /// Also print log to console.
    ///
    /// Default is true.
    #[serde(default = "Log::default_console_log")]
    console_log: bool,

    /// Path to log file. If not set, no log file is written.
    #[serde(default)]
    log_file: Option<PathBuf>,

    /// Log level.
    ///
    /// Default is `info`.
    #[serde(default = "Log::default_log_level")]
    log_level: LogLevel,
}

impl Log {
    const fn default_console_log() -> bool {
        true
    }

    const fn default_log_level() -> LogLevel {
        LogLevel::Info
    }

    #[must_use]
    pub const fn console_log(&self) -> bool {
        self.console_log
    }

    #[must_use]
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    #[must_use]
    pub const fn log_level(&self) -> LogLevel {
        self.log_level
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            console_log: Self::default_console_log(),
            log_file: None,
            log_level: Self::default_log_level(),
        }
    }
}
