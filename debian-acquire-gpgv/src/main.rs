// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {anyhow::Context, debian_acquire::gpgv::GpgvWorker, std::io};

fn main() {
    // stdout carries the protocol; logging goes to stderr.
    env_logger::init();

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut worker = GpgvWorker::new(stdin.lock(), stdout.lock());
    std::process::exit(
        match worker.run().context("acquire method control channel") {
            Ok(code) => code,
            Err(err) => {
                eprintln!("gpgv method: {:#}", err);
                100
            }
        },
    );
}
