// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The HTTP acquire method worker.

A double-buffered transfer loop: request bytes flow through the outbound
ring onto the socket, reply bytes through the inbound ring into the
destination file. One [HttpWorker::pump] step performs a single readiness
wait across the socket, the destination file, and the control channel, then
drains whichever endpoint is ready. Everything above it - header
consumption, chunked decoding, resume, the per-item state machine - is
sequenced by calling the pump until the buffers hold what the next decision
needs.
*/

pub mod request;
pub mod server;

use {
    crate::{
        abort::AbortHandle,
        buffer::Transfer,
        config::MethodConfig,
        error::{AcquireError, Result},
        http::{
            request::build_request,
            server::{Encoding, Phase, ServerState},
        },
        protocol::{
            AsyncMethodReader, AsyncMethodWriter, ControlStep, FetchItem, FetchResult, Message,
        },
    },
    filetime::FileTime,
    log::{debug, warn},
    std::{
        collections::VecDeque,
        fs,
        io::{self, Read, Seek, SeekFrom},
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite, Interest},
        net::TcpStream,
        time,
    },
};

const CAPABILITIES_VERSION: &str = "1.2";

/// A socket with no traffic for this long aborts the current fetch.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of one pump step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Pump {
    /// Progress was (possibly) made; call again.
    Continue,
    /// The transport is finished; stop pumping.
    Stop,
}

/// What one readiness wait observed.
enum Event {
    Control(ControlStep),
    SocketRead(io::Result<Transfer>),
    SocketWrite(io::Result<Transfer>),
    File(io::Result<()>),
    Timeout,
    Idle,
}

/// What to do with a parsed reply header block.
enum Disposition {
    /// 2xx; the destination file is open, transfer the body.
    Fetch,
    /// 304; the cached file is current.
    ImsHit,
    /// Terminal failure with no body to consume.
    Fail,
    /// Terminal failure, but the reply carries an error page that must be
    /// drained off the connection.
    FailWithBody,
}

enum HeadersError {
    Parse(AcquireError),
    Io(AcquireError),
}

async fn socket_ready(socket: Option<&TcpStream>, interest: Interest) -> io::Result<()> {
    match socket {
        Some(socket) => socket.ready(interest).await.map(|_| ()),
        None => std::future::pending().await,
    }
}

/// The HTTP worker: control channel, fetch queue, and transfer state.
pub struct HttpWorker<R, W> {
    control: AsyncMethodReader<R>,
    output: AsyncMethodWriter<W>,
    config: MethodConfig,
    abort: AbortHandle,
    queue: VecDeque<FetchItem>,
    server: Option<ServerState>,
    file: Option<fs::File>,
    fail_counter: u32,
    pending_error: Option<AcquireError>,
}

impl HttpWorker<tokio::io::Stdin, tokio::io::Stdout> {
    /// A worker bound to the process stdio, as spawned by the parent.
    pub fn stdio(abort: AbortHandle) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), abort)
    }
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> HttpWorker<R, W> {
    pub fn new(control: R, output: W, abort: AbortHandle) -> Self {
        Self {
            control: AsyncMethodReader::new(control),
            output: AsyncMethodWriter::new(output),
            config: MethodConfig::default(),
            abort,
            queue: VecDeque::new(),
            server: None,
            file: None,
            fail_counter: 0,
            pending_error: None,
        }
    }

    /// Serve fetch requests until the control channel closes.
    ///
    /// Returns the process exit code.
    pub async fn run(&mut self) -> Result<i32> {
        self.output
            .send(&Message::capabilities(CAPABILITIES_VERSION, false, true))
            .await?;

        loop {
            if self.fail_counter >= 2 {
                if let Some(item) = self.queue.pop_front() {
                    self.output
                        .send(&Message::uri_failure(&item.uri, "Massive Server Brain Damage"))
                        .await?;
                }
                self.fail_counter = 0;
                continue;
            }

            let item = match self.queue.front() {
                Some(item) => item.clone(),
                None => match self.control.next_message().await? {
                    Some(message) => {
                        self.handle_message(message)?;
                        continue;
                    }
                    None => return Ok(0),
                },
            };

            self.fetch(item).await?;
        }
    }

    fn handle_message(&mut self, message: Message) -> Result<()> {
        match message.code() {
            600 => {
                let item = FetchItem::from_message(&message)?;
                debug!("queued {}", item.uri);
                self.queue.push_back(item);
            }
            601 => self.config.merge_message(&message),
            code => debug!("ignoring message code {}", code),
        }
        Ok(())
    }

    /// Run one fetch attempt for the item at the head of the queue.
    async fn fetch(&mut self, item: FetchItem) -> Result<()> {
        self.pending_error = None;

        let mut server = match self.server.take() {
            Some(server) if server.matches(&item.uri) => server,
            _ => ServerState::new(item.uri.clone()),
        };

        if server.socket.is_none() {
            let host = item.uri.host_str().unwrap_or_default();
            self.output
                .send(&Message::status(&item.uri, format!("Connecting to {}", host)))
                .await?;
        }
        if let Err(e) = server.open(&self.config).await {
            self.fail(&item, &e.to_string()).await?;
            self.server = Some(server);
            return Ok(());
        }

        server.outbound.enqueue(&build_request(&item, &server));

        self.output
            .send(&Message::status(&item.uri, "Waiting for file"))
            .await?;
        match self.run_headers(&mut server).await {
            Ok(()) => {}
            Err(HeadersError::Parse(e)) => {
                warn!("reply header parse failure: {}", e);
                self.fail(&item, "Bad header Data").await?;
                self.server = Some(server);
                return Ok(());
            }
            Err(HeadersError::Io(e)) => {
                // The connection went away under the request; retry once
                // on a fresh one.
                debug!("connection failed while waiting for headers: {}", e);
                self.fail_counter += 1;
                server.close();
                self.server = Some(server);
                return Ok(());
            }
        }
        debug!(
            "reply: HTTP/{}.{} {} {}",
            server.major, server.minor, server.result, server.reason
        );

        match self.deal_with_headers(&item, &mut server) {
            Ok(Disposition::Fetch) => {
                let mut res = FetchResult::new(item.uri.clone(), item.destination.clone());
                res.size = server.size;
                res.last_modified = Some(server.date);
                res.resume_point = server.start_pos;
                self.output.send(&Message::uri_start(&res)).await?;

                let outcome = self.run_data(&mut server).await;

                self.abort.disarm();
                let digest = server.inbound.take_digest_hex();
                self.file = None;

                // Stamp the server date whether or not the transfer
                // completed: a correctly dated partial file is what makes
                // the next If-Range attempt valid.
                let stamp = FileTime::from_unix_time(server.date.timestamp(), 0);
                let _ = filetime::set_file_times(&item.destination, stamp, stamp);

                match outcome {
                    Ok(()) => {
                        if let Some(start) = server.inbound.start_time() {
                            debug!("transfer finished after {:?}", start.elapsed());
                        }
                        res.size = fs::metadata(&item.destination)
                            .map(|m| m.len())
                            .unwrap_or(server.size);
                        res.md5_hex = digest;
                        self.done(&res).await?;
                    }
                    Err(e) => self.fail(&item, &e.to_string()).await?,
                }
            }
            Ok(Disposition::ImsHit) => {
                let mut res = FetchResult::new(item.uri.clone(), item.destination.clone());
                res.ims_hit = true;
                res.last_modified = item.last_modified;
                self.done(&res).await?;
            }
            Ok(Disposition::Fail) => {
                let text = format!("{} {}", server.result, server.reason);
                self.fail(&item, &text).await?;
            }
            Ok(Disposition::FailWithBody) => {
                let text = format!("{} {}", server.result, server.reason);
                self.fail(&item, &text).await?;

                // The reply is a 404-style error page; drain it so the
                // connection stays usable for the next request.
                match fs::OpenOptions::new().write(true).open("/dev/null") {
                    Ok(sink) => {
                        self.file = Some(sink);
                        if let Err(e) = self.run_data(&mut server).await {
                            debug!("discarding error page failed: {}", e);
                            server.close();
                        }
                        self.file = None;
                    }
                    Err(_) => server.close(),
                }
            }
            Err(e) => {
                self.abort.disarm();
                self.file = None;
                self.fail(&item, &e.to_string()).await?;
            }
        }

        self.server = Some(server);
        self.fail_counter = 0;
        Ok(())
    }

    /// Report failure for the queue head and advance the queue.
    async fn fail(&mut self, item: &FetchItem, text: &str) -> Result<()> {
        self.queue.pop_front();
        self.output.send(&Message::uri_failure(&item.uri, text)).await
    }

    /// Report completion for the queue head and advance the queue.
    async fn done(&mut self, res: &FetchResult) -> Result<()> {
        self.queue.pop_front();
        self.output.send(&Message::uri_done(res)).await
    }

    /// Pump until a complete header block is buffered, then parse it.
    async fn run_headers(&mut self, server: &mut ServerState) -> std::result::Result<(), HeadersError> {
        server.phase = Phase::Header;
        server.reset_reply();

        loop {
            if let Some(block) = server.inbound.write_till_el(false) {
                for line in block.lines() {
                    server.header_line(line).map_err(HeadersError::Parse)?;
                }
                return Ok(());
            }
            match self.pump(server, false).await.map_err(HeadersError::Io)? {
                Pump::Continue => {}
                Pump::Stop => {
                    return Err(HeadersError::Io(
                        self.pending_error.take().unwrap_or(AcquireError::ServerClosed),
                    ))
                }
            }
        }
    }

    /// Decide what the parsed reply means for this item, opening the
    /// destination file on the data-follows path.
    fn deal_with_headers(
        &mut self,
        item: &FetchItem,
        server: &mut ServerState,
    ) -> Result<Disposition> {
        if server.result == 304 {
            let _ = fs::remove_file(&item.destination);
            return Ok(Disposition::ImsHit);
        }

        if server.result < 200 || server.result >= 300 {
            return Ok(if server.have_content {
                Disposition::FailWithBody
            } else {
                Disposition::Fail
            });
        }

        // Some sort of 2xx 'data follows' reply.
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&item.destination)?;
        file.set_len(server.start_pos)?;
        file.seek(SeekFrom::End(0))?;
        self.abort.arm(&item.destination, server.date);

        server.inbound.enable_digest();
        if server.start_pos > 0 {
            // The digest must cover the bytes already on disk.
            let mut prefix = fs::File::open(&item.destination)?;
            let mut remaining = server.start_pos;
            let mut chunk = [0u8; 8192];
            while remaining > 0 {
                let want = chunk.len().min(remaining as usize);
                let n = prefix.read(&mut chunk[..want])?;
                if n == 0 {
                    break;
                }
                server.inbound.feed_digest(&chunk[..n]);
                remaining -= n as u64;
            }
        }

        self.file = Some(file);
        Ok(Disposition::Fetch)
    }

    /// Transfer the reply body into the open destination.
    async fn run_data(&mut self, server: &mut ServerState) -> Result<()> {
        server.phase = Phase::Data;

        match server.encoding {
            Encoding::Chunked => loop {
                server.inbound.unlimit();
                let line = self.read_line(server).await?;
                let digits: String = line
                    .trim_start()
                    .chars()
                    .take_while(|c| c.is_ascii_hexdigit())
                    .collect();
                let len = u64::from_str_radix(&digits, 16).unwrap_or(0);

                if len == 0 {
                    // Remove the entity trailer.
                    loop {
                        let trailer = self.read_line(server).await?;
                        if trailer.len() <= 2 {
                            return Ok(());
                        }
                    }
                }

                server.inbound.limit(len);
                loop {
                    if server.inbound.is_limit() {
                        break;
                    }
                    match self.pump(server, true).await? {
                        Pump::Continue => {}
                        Pump::Stop => {
                            return Err(self
                                .pending_error
                                .take()
                                .unwrap_or(AcquireError::ServerClosed))
                        }
                    }
                }

                // The server sends an extra line before the next block
                // specifier.
                server.inbound.unlimit();
                let _ = self.read_line(server).await?;
            },
            encoding => {
                if encoding == Encoding::Closes {
                    server.inbound.unlimit();
                } else {
                    server.inbound.limit(server.size - server.start_pos);
                }

                loop {
                    if server.inbound.is_limit() {
                        server.inbound.unlimit();
                        return Ok(());
                    }
                    match self.pump(server, true).await? {
                        Pump::Continue => {}
                        Pump::Stop => break,
                    }
                }

                self.flush(server)
            }
        }
    }

    /// Pump until a single line can be popped from the inbound ring.
    async fn read_line(&mut self, server: &mut ServerState) -> Result<String> {
        loop {
            if let Some(line) = server.inbound.write_till_el(true) {
                return Ok(line);
            }
            match self.pump(server, false).await? {
                Pump::Continue => {}
                Pump::Stop => {
                    return Err(self
                        .pending_error
                        .take()
                        .unwrap_or(AcquireError::ServerClosed))
                }
            }
        }
    }

    /// Drain the tail of the inbound ring into the destination once the
    /// transport has terminated.
    fn flush(&mut self, server: &mut ServerState) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            if !server.inbound.write_space() {
                return Ok(());
            }
            server.inbound.drain_to(file).map_err(AcquireError::FileWrite)?;
            if server.inbound.is_limit() || server.encoding == Encoding::Closes {
                return Ok(());
            }
        }
        Err(self
            .pending_error
            .take()
            .unwrap_or(AcquireError::ServerClosed))
    }

    /// One readiness-wait step over {socket r/w, file w, control in}.
    ///
    /// `to_file` allows draining the inbound ring into the destination;
    /// header and chunk-line consumption run with it off so body bytes stay
    /// buffered until the framing is known.
    async fn pump(&mut self, server: &mut ServerState, to_file: bool) -> Result<Pump> {
        if server.socket.is_none() && !server.inbound.write_space() {
            return Ok(Pump::Stop);
        }

        let event = {
            let socket = server.socket.as_ref();
            let want_read = socket.is_some() && server.inbound.read_space();
            let want_write = socket.is_some() && server.outbound.write_space();
            let want_file = to_file
                && self.file.is_some()
                && server.inbound.write_space()
                && !server.inbound.is_limit();

            tokio::select! {
                biased;
                step = self.control.step() => Event::Control(step?),
                _ = socket_ready(socket, Interest::READABLE), if want_read => match socket {
                    Some(socket) => Event::SocketRead(server.inbound.read_from(socket)),
                    None => Event::Idle,
                },
                _ = socket_ready(socket, Interest::WRITABLE), if want_write => match socket {
                    Some(socket) => Event::SocketWrite(server.outbound.write_to_socket(socket)),
                    None => Event::Idle,
                },
                _ = std::future::ready(()), if want_file => match self.file.as_mut() {
                    Some(file) => Event::File(server.inbound.drain_to(file)),
                    None => Event::Idle,
                },
                _ = time::sleep(IDLE_TIMEOUT) => Event::Timeout,
            }
        };

        match event {
            Event::Control(ControlStep::Message(message)) => {
                self.handle_message(message)?;
                Ok(Pump::Continue)
            }
            Event::Control(ControlStep::Line) => Ok(Pump::Continue),
            Event::Control(ControlStep::Eof) => {
                // The parent went away mid-transfer.
                std::process::exit(100);
            }
            Event::SocketRead(Ok(Transfer::Again)) => Ok(Pump::Continue),
            Event::SocketRead(Ok(Transfer::Closed)) => self.server_die(server, None),
            Event::SocketRead(Err(e)) => self.server_die(server, Some(e.into())),
            Event::SocketWrite(Ok(Transfer::Again)) => Ok(Pump::Continue),
            Event::SocketWrite(Ok(Transfer::Closed)) => self.server_die(server, None),
            Event::SocketWrite(Err(e)) => self.server_die(server, Some(e.into())),
            Event::File(Ok(())) => Ok(Pump::Continue),
            Event::File(Err(e)) => Err(AcquireError::FileWrite(e)),
            Event::Timeout => {
                warn!("connection timed out");
                self.server_die(server, Some(AcquireError::ConnectionTimedOut))
            }
            Event::Idle => Ok(Pump::Continue),
        }
    }

    /// The socket reported EOF or an error.
    ///
    /// A close can be the legitimate end of a Closes-encoded body or of a
    /// satisfied length-bounded stream; anything else is a transport error.
    fn server_die(&mut self, server: &mut ServerState, cause: Option<AcquireError>) -> Result<Pump> {
        if server.phase == Phase::Data {
            if let Some(file) = self.file.as_mut() {
                server.inbound.drain_to(file).map_err(AcquireError::FileWrite)?;
                if server.inbound.is_limit() {
                    return Ok(Pump::Continue);
                }
            }
        }

        if !server.inbound.is_limit()
            && server.phase != Phase::Header
            && server.encoding != Encoding::Closes
        {
            return Err(cause.unwrap_or(AcquireError::ServerClosed));
        }

        server.inbound.unlimit();
        if let Some(cause) = cause {
            self.pending_error = Some(cause);
        }
        if !server.inbound.write_space() {
            return Ok(Pump::Stop);
        }

        // The buffer may still hold a complete (pipelined) reply; keep it
        // and drop only the socket.
        server.close();
        Ok(Pump::Continue)
    }
}
