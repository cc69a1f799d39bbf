// Copyright 2022. The Agora Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

mod cli;
mod init;
mod node;

use std::process;

use agora_common::{dir_utils::default_data_dir, exit_codes::ExitError, initialize_logging};
use clap::Parser;
use log::LevelFilter;

use crate::cli::{Cli, Command};

fn main() {
    let cli = Cli::parse();
    match main_inner(cli) {
        Ok(()) => process::exit(0),
        Err(err) => {
            err.eprint_details();
            process::exit(err.as_i32());
        },
    }
}

fn main_inner(cli: Cli) -> Result<(), ExitError> {
    let base_dir = cli.base_dir.unwrap_or_else(default_data_dir);
    match cli.command {
        Command::Init { mnemonic, force } => init::run_init(&base_dir, mnemonic.as_deref(), force),
        Command::Start => {
            if !initialize_logging(&base_dir, LevelFilter::Info) {
                eprintln!("Logging was already initialized, continuing");
            }
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| ExitError::UnknownError(e.to_string()))?;
            runtime.block_on(node::run_node(&base_dir))
        },
    }
}
