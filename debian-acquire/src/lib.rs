// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! APT acquire method workers.

APT delegates actual file retrieval to *acquire methods*: worker processes
it spawns per transport and drives over a line-oriented protocol on
stdin/stdout. This crate implements that worker side for two transports:

- An HTTP/1.1 fetch worker ([http::HttpWorker]) built around two circular
  buffers multiplexed through a single readiness wait per step. It keeps
  one persistent connection per origin, sends conditional requests
  (`If-Modified-Since`, `Range` + `If-Range` for resuming partial files),
  decodes chunked transfer encoding, accumulates the MD5 of the stored
  body, and preserves resume state across aborts by stamping partial files
  with the server date.
- A signature verification worker ([gpgv::GpgvWorker]) that runs an
  external `gpgv` with its status stream on file descriptor 3 and maps the
  classified signers onto APT's trust policy.

The protocol surface shared by both lives in [protocol]; configuration
forwarded by the parent in [config]. The workers themselves are thin
binaries in sibling crates.

Deliberately out of scope: TLS, proxy authentication, HTTP/2, connection
pooling across origins, and content decompression. The DNS cache holds
exactly one entry on purpose: with rotating DNS, reusing the last observed
address within a burst of requests beats spreading them over the rotation.
*/

pub mod abort;
pub mod buffer;
pub mod config;
pub mod error;
pub mod gpgv;
pub mod http;
pub mod protocol;
pub mod timefmt;
