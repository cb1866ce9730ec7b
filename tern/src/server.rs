// Copyright (c) 2021 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Entry point of the broker.

use clap::{Arg, ArgAction};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use crate::auth::{self, AuthService};
use crate::commands::ConnectionId;
use crate::config::Config;
use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, ErrorKind};
use crate::log::init_log;

pub const DEFAULT_CONFIG: &str = "/etc/tern/tern.toml";
const OPT_CONFIG: &str = "config";
const OPT_TEST: &str = "test";

const DISPATCHER_CHANNEL_CAPACITY: usize = 256;

/// Entry point of server.
///
/// # Errors
///
/// Returns error if config file is invalid or the server fails at runtime.
pub fn run_server() -> Result<(), Error> {
    let command = clap::Command::new("Tern")
        .version(env!("CARGO_PKG_VERSION"))
        .about("MQTT 3.1.1 broker")
        .arg(
            Arg::new(OPT_CONFIG)
                .short('c')
                .long(OPT_CONFIG)
                .value_name("config_file")
                .help("Specify config file path"),
        )
        .arg(
            Arg::new(OPT_TEST)
                .short('t')
                .long(OPT_TEST)
                .action(ArgAction::SetTrue)
                .help("Test config file and exit"),
        );
    let matches = match command.try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            let _ret = err.print();
            if matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) {
                return Ok(());
            }
            return Err(Error::from_string(
                ErrorKind::ParameterError,
                err.to_string(),
            ));
        }
    };

    let config_file = if let Some(config_file) = matches.get_one::<String>(OPT_CONFIG) {
        Some(config_file.as_str())
    } else if Path::new(DEFAULT_CONFIG).exists() {
        Some(DEFAULT_CONFIG)
    } else {
        None
    };

    let config = if let Some(config_file) = config_file {
        let config_content = std::fs::read_to_string(config_file)?;
        let config: Config = toml::from_str(&config_content).map_err(|err| {
            Error::from_string(ErrorKind::ConfigError, format!("Invalid config: {err:?}"))
        })?;

        config.validate()?;

        if matches.get_flag(OPT_TEST) {
            println!("The configuration file {config_file} syntax is Ok");
            return Ok(());
        }
        config
    } else {
        Config::default()
    };

    init_log(config.log())?;

    let server = ServerContext::new(config)?;
    let runtime = Runtime::new()?;
    server.run_loop(&runtime)
}

/// Holds the config and services shared by all connections.
pub struct ServerContext {
    config: Config,
    auth: Arc<dyn AuthService>,
}

impl ServerContext {
    /// Resolve the configured services and build the server.
    ///
    /// # Errors
    ///
    /// Returns error if the configured auth service factory is unknown or
    /// fails to build.
    pub fn new(config: Config) -> Result<Self, Error> {
        let auth = auth::new_auth_service(&config)?;
        Ok(Self { config, auth })
    }

    /// Run the server on `runtime` until it is terminated.
    ///
    /// # Errors
    ///
    /// Returns error if binding the server address fails.
    pub fn run_loop(self, runtime: &Runtime) -> Result<(), Error> {
        runtime.block_on(self.run())
    }

    /// Bind the server address and accept connections forever.
    ///
    /// Per-connection errors are confined to their connection task; only the
    /// bind error is surfaced.
    ///
    /// # Errors
    ///
    /// Returns error if binding the server address fails.
    pub async fn run(self) -> Result<(), Error> {
        let address = self.config.general().address();
        let listener = TcpListener::bind(address).await.map_err(|err| {
            Error::from_string(
                ErrorKind::SocketError,
                format!("Failed to bind to {address}, err: {err}"),
            )
        })?;
        log::info!("server: Listening on {address}");

        let (dispatcher_sender, dispatcher_receiver) =
            mpsc::channel(DISPATCHER_CHANNEL_CAPACITY);
        let dispatcher = Dispatcher::new(
            self.config.general(),
            dispatcher_sender.clone(),
            dispatcher_receiver,
        );
        tokio::spawn(dispatcher.run_loop());

        let mut next_connection_id: ConnectionId = 0;
        loop {
            match listener.accept().await {
                Ok((stream, remote_address)) => {
                    next_connection_id += 1;
                    let connection = Connection::new(
                        next_connection_id,
                        stream,
                        remote_address,
                        self.config.general(),
                        Arc::clone(&self.auth),
                        dispatcher_sender.clone(),
                    );
                    tokio::spawn(connection.run_loop());
                }
                Err(err) => {
                    log::error!("server: Failed to accept connection, err: {err}");
                }
            }
        }
    }
}
