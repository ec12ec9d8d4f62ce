// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Per-origin connection state and reply header parsing. */

use {
    crate::{
        buffer::CircleBuf,
        config::MethodConfig,
        error::{AcquireError, Result},
        timefmt,
    },
    chrono::{DateTime, Utc},
    log::debug,
    once_cell::sync::Lazy,
    std::{
        net::{IpAddr, SocketAddr, ToSocketAddrs},
        sync::Mutex,
    },
    tokio::net::TcpStream,
    url::Url,
};

/// Header lines longer than this are treated as hostile.
const MAX_HEADER_LINE: usize = 65536;

const INBOUND_SIZE: usize = 64 * 1024;
const OUTBOUND_SIZE: usize = 1024;

/// How the reply body is framed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoding {
    /// Neither Content-Length nor Transfer-Encoding: the connection close
    /// delimits the body.
    Closes,
    /// Content-Length delimited.
    Stream,
    /// Chunked transfer encoding.
    Chunked,
}

/// Where the reply currently stands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Header,
    Data,
}

/// The last host resolved, kept across requests.
///
/// Mirror of the upstream behavior built for rotating DNS: reusing the one
/// previously observed address within a burst beats spreading requests over
/// the rotation. Deliberately a single entry.
static LAST_HOST: Lazy<Mutex<Option<(String, IpAddr)>>> = Lazy::new(|| Mutex::new(None));

fn resolve_cached(host: &str, port: u16) -> Result<SocketAddr> {
    let mut last = LAST_HOST.lock().expect("dns cache lock");
    if let Some((cached_host, addr)) = last.as_ref() {
        if cached_host == host {
            return Ok(SocketAddr::new(*addr, port));
        }
    }

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|_| AcquireError::Resolve(host.to_string()))?
        .next()
        .ok_or_else(|| AcquireError::Resolve(host.to_string()))?;
    *last = Some((host.to_string(), addr.ip()));
    Ok(addr)
}

/// Connection and reply state for one origin.
pub struct ServerState {
    pub uri: Url,
    pub inbound: CircleBuf,
    pub outbound: CircleBuf,
    pub socket: Option<TcpStream>,
    pub proxy: Option<Url>,

    pub major: u32,
    pub minor: u32,
    pub result: u32,
    pub reason: String,
    pub size: u64,
    pub start_pos: u64,
    pub date: DateTime<Utc>,
    pub have_content: bool,
    pub encoding: Encoding,
    pub phase: Phase,
}

impl ServerState {
    pub fn new(uri: Url) -> Self {
        let mut state = Self {
            uri,
            inbound: CircleBuf::new(INBOUND_SIZE),
            outbound: CircleBuf::new(OUTBOUND_SIZE),
            socket: None,
            proxy: None,
            major: 0,
            minor: 0,
            result: 0,
            reason: String::new(),
            size: 0,
            start_pos: 0,
            date: Utc::now(),
            have_content: false,
            encoding: Encoding::Closes,
            phase: Phase::Header,
        };
        state.reset_reply();
        state
    }

    /// Whether this state can serve the given URI over the live connection.
    pub fn matches(&self, uri: &Url) -> bool {
        self.uri.scheme() == uri.scheme()
            && self.uri.host_str() == uri.host_str()
            && self.uri.port() == uri.port()
    }

    /// Re-initialize the parsed-reply fields for the next response.
    pub fn reset_reply(&mut self) {
        self.major = 0;
        self.minor = 0;
        self.result = 0;
        self.reason.clear();
        self.size = 0;
        self.start_pos = 0;
        self.date = Utc::now();
        self.have_content = false;
        self.encoding = Encoding::Closes;
    }

    /// The host and port the TCP connection targets: the origin when
    /// direct, the proxy otherwise.
    pub fn connect_target(&self) -> Result<(String, u16)> {
        let endpoint = match &self.proxy {
            Some(proxy) => proxy,
            None => &self.uri,
        };
        let host = endpoint
            .host_str()
            .ok_or_else(|| AcquireError::Resolve(endpoint.to_string()))?;
        Ok((host.to_string(), endpoint.port().unwrap_or(80)))
    }

    /// Establish the connection, reusing an already open one.
    pub async fn open(&mut self, config: &MethodConfig) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        self.inbound.reset();
        self.outbound.reset();
        self.select_proxy(config)?;

        let (host, port) = self.connect_target()?;
        let addr = resolve_cached(&host, port)?;
        debug!("connecting to {} ({})", host, addr);

        let socket = TcpStream::connect(addr)
            .await
            .map_err(|e| AcquireError::Connect(host, e))?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Drop the connection. Never fails.
    pub fn close(&mut self) {
        self.socket = None;
    }

    /// Determine the proxy for this origin.
    ///
    /// `Acquire::http::Proxy::<host>` overrides `Acquire::http::Proxy`,
    /// which in turn overrides the `http_proxy` environment variable. The
    /// per-host value `DIRECT` forces a direct connection.
    fn select_proxy(&mut self, config: &MethodConfig) -> Result<()> {
        let host = self.uri.host_str().unwrap_or_default();
        let specific = config.find(&format!("Acquire::http::Proxy::{}", host));

        let chosen = match specific {
            Some("DIRECT") => None,
            Some(proxy) => Some(proxy.to_string()),
            None => config
                .find("Acquire::http::Proxy")
                .map(String::from)
                .or_else(|| std::env::var("http_proxy").ok()),
        };

        self.proxy = match chosen {
            Some(proxy) if !proxy.is_empty() => Some(Url::parse(&proxy)?),
            _ => None,
        };
        Ok(())
    }

    /// Process one reply header line.
    pub fn header_line(&mut self, line: &str) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }
        if line.len() >= MAX_HEADER_LINE {
            return Err(AcquireError::HeaderLineTooLong(MAX_HEADER_LINE));
        }

        if line.len() >= 4 && line[..4].eq_ignore_ascii_case("HTTP") {
            return self.status_line(line);
        }

        let (tag, value) = line.split_once(':').ok_or(AcquireError::BadHeaderLine)?;
        let value = value.trim();

        if tag.eq_ignore_ascii_case("Content-Length") {
            if self.encoding == Encoding::Closes {
                self.encoding = Encoding::Stream;
            }
            self.have_content = true;

            // Already derived from Content-Range.
            if self.start_pos != 0 {
                return Ok(());
            }
            self.size = value
                .parse()
                .map_err(|_| AcquireError::InvalidContentLength)?;
        } else if tag.eq_ignore_ascii_case("Content-Type") {
            self.have_content = true;
        } else if tag.eq_ignore_ascii_case("Content-Range") {
            self.have_content = true;
            let (start, total) = parse_content_range(value)?;
            if start > total {
                return Err(AcquireError::BrokenRangeSupport);
            }
            self.start_pos = start;
            self.size = total;
        } else if tag.eq_ignore_ascii_case("Transfer-Encoding") {
            self.have_content = true;
            if value.eq_ignore_ascii_case("chunked") {
                self.encoding = Encoding::Chunked;
            }
        } else if tag.eq_ignore_ascii_case("Last-Modified") {
            self.date = timefmt::parse(value).ok_or(AcquireError::UnknownDateFormat)?;
        }

        Ok(())
    }

    /// Parse the status line, tolerating the version-less HTTP/0.9 form.
    fn status_line(&mut self, line: &str) -> Result<()> {
        let rest = if line.as_bytes().get(4) == Some(&b'/') {
            let rest = &line[5..];
            let (version, rest) = rest
                .split_once(' ')
                .ok_or(AcquireError::InvalidReplyHeader)?;
            let (major, minor) = version
                .split_once('.')
                .ok_or(AcquireError::InvalidReplyHeader)?;
            self.major = major
                .parse()
                .map_err(|_| AcquireError::InvalidReplyHeader)?;
            self.minor = minor
                .parse()
                .map_err(|_| AcquireError::InvalidReplyHeader)?;
            rest
        } else {
            // Evil servers return no version.
            self.major = 0;
            self.minor = 9;
            line[4..].trim_start()
        };

        let rest = rest.trim_start();
        let (code, reason) = rest
            .split_once(' ')
            .ok_or(AcquireError::InvalidReplyHeader)?;
        self.result = code.parse().map_err(|_| AcquireError::InvalidReplyHeader)?;
        self.reason = reason.trim().to_string();
        if self.reason.is_empty() {
            return Err(AcquireError::InvalidReplyHeader);
        }
        Ok(())
    }
}

/// Parse `bytes START-END/TOTAL`, returning `(START, TOTAL)`.
fn parse_content_range(value: &str) -> Result<(u64, u64)> {
    let rest = value
        .strip_prefix("bytes")
        .ok_or(AcquireError::InvalidContentRange)?
        .trim_start();
    let (range, total) = rest
        .split_once('/')
        .ok_or(AcquireError::InvalidContentRange)?;
    let (start, _end) = range
        .split_once('-')
        .ok_or(AcquireError::InvalidContentRange)?;

    let start = start
        .trim()
        .parse()
        .map_err(|_| AcquireError::InvalidContentRange)?;
    let total = total
        .trim()
        .parse()
        .map_err(|_| AcquireError::InvalidContentRange)?;
    Ok((start, total))
}
