// Copyright (c) 2020 The Tern Project Developers. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use std::process;

use tern::server;
use tern::ErrorKind;

#[cfg(feature = "allocator")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn main() {
    if let Err(err) = server::run_server() {
        eprintln!("tern: {err}");
        let exit_code = if err.kind() == &ErrorKind::ParameterError {
            1
        } else {
            2
        };
        process::exit(exit_code);
    }
}
