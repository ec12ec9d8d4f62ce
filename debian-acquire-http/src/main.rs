// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    anyhow::Context,
    debian_acquire::{abort, abort::AbortHandle, http::HttpWorker},
};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // stdout carries the protocol; logging goes to stderr.
    env_logger::init();

    let handle = AbortHandle::default();
    abort::install(&handle);

    let mut worker = HttpWorker::stdio(handle);
    std::process::exit(
        match worker.run().await.context("acquire method control channel") {
            Ok(code) => code,
            Err(err) => {
                eprintln!("http method: {:#}", err);
                100
            }
        },
    );
}
