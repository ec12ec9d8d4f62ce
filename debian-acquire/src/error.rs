// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use thiserror::Error;

/// Primary crate error type.
///
/// The `Display` strings double as the `Message` field of `URI Failure`
/// replies, so they are worded for the parent process, not for programmers.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("Could not resolve '{0}'")]
    Resolve(String),

    #[error("Could not connect to {0}: {1}")]
    Connect(String, std::io::Error),

    #[error("Got a single header line over {0} chars")]
    HeaderLineTooLong(usize),

    #[error("Bad header line")]
    BadHeaderLine,

    #[error("The http server sent an invalid reply header")]
    InvalidReplyHeader,

    #[error("The http server sent an invalid Content-Length header")]
    InvalidContentLength,

    #[error("The http server sent an invalid Content-Range header")]
    InvalidContentRange,

    #[error("This http server has broken range support")]
    BrokenRangeSupport,

    #[error("Unknown date format")]
    UnknownDateFormat,

    #[error("Error reading from server - remote end closed connection")]
    ServerClosed,

    #[error("Connection timed out")]
    ConnectionTimedOut,

    #[error("Error writing to output file: {0}")]
    FileWrite(std::io::Error),
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, AcquireError>;
