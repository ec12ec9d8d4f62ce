// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The acquire method protocol.

Workers talk to the parent acquire process through a line-oriented message
stream on stdin/stdout. A message is a numeric status line (`600 URI
Acquire`) followed by `Tag: value` lines and terminated by a blank line.

The parent sends `600 URI Acquire` requests and `601 Configuration`
snapshots; workers reply with `100 Capabilities`, `102 Status`,
`200 URI Start`, `201 URI Done`, and `400 URI Failure`.

Both a blocking reader (the gpgv worker waits on its child anyway) and an
async reader (the HTTP worker polls the control channel from its transfer
pump) are provided.
*/

use {
    crate::{
        error::{AcquireError, Result},
        timefmt,
    },
    chrono::{DateTime, Utc},
    std::{
        io::{BufRead, Write},
        path::PathBuf,
    },
    tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    url::Url,
};

/// One protocol message: status code, description, and tag lines.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    code: u16,
    info: String,
    fields: Vec<(String, String)>,
}

impl Message {
    pub fn new(code: u16, info: impl ToString) -> Self {
        Self {
            code,
            info: info.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn info(&self) -> &str {
        &self.info
    }

    /// Append a tag line.
    pub fn push_field(&mut self, tag: impl ToString, value: impl ToString) {
        self.fields.push((tag.to_string(), value.to_string()));
    }

    /// Builder-style [Self::push_field].
    pub fn field(mut self, tag: impl ToString, value: impl ToString) -> Self {
        self.push_field(tag, value);
        self
    }

    /// First value of a tag, compared case-insensitively.
    pub fn get(&self, tag: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| t.eq_ignore_ascii_case(tag))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a repeated tag, in message order.
    pub fn values<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(t, _)| t.eq_ignore_ascii_case(tag))
            .map(|(_, v)| v.as_str())
    }

    /// Parse a message from its lines, sans blank-line terminator.
    pub fn from_lines(lines: &[String]) -> Result<Self> {
        let status = lines
            .first()
            .ok_or_else(|| AcquireError::Protocol("empty message".to_string()))?;
        let (code, info) = status.split_once(' ').unwrap_or((status.as_str(), ""));
        let code = code
            .parse::<u16>()
            .map_err(|_| AcquireError::Protocol(format!("bad status line: {}", status)))?;

        let mut message = Message::new(code, info);
        for line in &lines[1..] {
            let (tag, value) = line
                .split_once(':')
                .ok_or_else(|| AcquireError::Protocol(format!("bad tag line: {}", line)))?;
            message.push_field(tag, value.trim_start());
        }

        Ok(message)
    }

    /// Render the message in wire format, including the blank-line terminator.
    pub fn render(&self) -> String {
        let mut out = format!("{} {}\n", self.code, self.info);
        for (tag, value) in &self.fields {
            out.push_str(tag);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out
    }

    pub fn capabilities(version: &str, single_instance: bool, send_config: bool) -> Self {
        let mut message = Message::new(100, "Capabilities").field("Version", version);
        if single_instance {
            message.push_field("Single-Instance", "true");
        }
        if send_config {
            message.push_field("Send-Config", "true");
        }
        message
    }

    pub fn status(uri: &Url, text: impl ToString) -> Self {
        Message::new(102, "Status")
            .field("URI", uri)
            .field("Message", text)
    }

    pub fn uri_start(res: &FetchResult) -> Self {
        let mut message = Message::new(200, "URI Start").field("URI", &res.uri);
        if res.size > 0 {
            message.push_field("Size", res.size);
        }
        if let Some(lm) = res.last_modified {
            message.push_field("Last-Modified", timefmt::rfc1123(lm));
        }
        if res.resume_point > 0 {
            message.push_field("Resume-Point", res.resume_point);
        }
        message
    }

    pub fn uri_done(res: &FetchResult) -> Self {
        let mut message = Message::new(201, "URI Done")
            .field("URI", &res.uri)
            .field("Filename", res.filename.display());
        if res.size > 0 {
            message.push_field("Size", res.size);
        }
        if let Some(lm) = res.last_modified {
            message.push_field("Last-Modified", timefmt::rfc1123(lm));
        }
        if let Some(md5) = &res.md5_hex {
            message.push_field("MD5-Hash", md5);
        }
        if res.ims_hit {
            message.push_field("IMS-Hit", "true");
        }
        for signer in &res.signers {
            message.push_field("GPGVOutput", signer);
        }
        message
    }

    pub fn uri_failure(uri: &Url, text: impl ToString) -> Self {
        Message::new(400, "URI Failure")
            .field("URI", uri)
            .field("Message", text)
    }
}

/// One fetch request from the parent, immutable for the attempt.
#[derive(Clone, Debug)]
pub struct FetchItem {
    pub uri: Url,
    pub destination: PathBuf,
    pub last_modified: Option<DateTime<Utc>>,
    pub signed_by: Option<String>,
}

impl FetchItem {
    /// Build an item from a `600 URI Acquire` message.
    pub fn from_message(message: &Message) -> Result<Self> {
        let uri = Url::parse(
            message
                .get("URI")
                .ok_or_else(|| AcquireError::Protocol("600 without URI".to_string()))?,
        )?;
        let destination = PathBuf::from(
            message
                .get("Filename")
                .ok_or_else(|| AcquireError::Protocol("600 without Filename".to_string()))?,
        );

        Ok(Self {
            uri,
            destination,
            last_modified: message.get("Last-Modified").and_then(timefmt::parse),
            signed_by: message.get("Signed-By").map(String::from),
        })
    }
}

/// Outcome of one fetch, reported back as `URI Start`/`URI Done`.
#[derive(Clone, Debug)]
pub struct FetchResult {
    pub uri: Url,
    pub filename: PathBuf,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub resume_point: u64,
    pub ims_hit: bool,
    pub md5_hex: Option<String>,
    pub signers: Vec<String>,
}

impl FetchResult {
    pub fn new(uri: Url, filename: PathBuf) -> Self {
        Self {
            uri,
            filename,
            size: 0,
            last_modified: None,
            resume_point: 0,
            ims_hit: false,
            md5_hex: None,
            signers: Vec::new(),
        }
    }
}

/// Blocking message reader over the control channel.
pub struct MethodReader<R> {
    source: R,
}

impl<R: BufRead> MethodReader<R> {
    pub fn new(source: R) -> Self {
        Self { source }
    }

    /// Read the next complete message. `None` means the channel closed.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if self.source.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !lines.is_empty() {
                    return Ok(Some(Message::from_lines(&lines)?));
                }
            } else {
                lines.push(line.to_string());
            }
        }
    }
}

/// Blocking message writer.
pub struct MethodWriter<W> {
    sink: W,
}

impl<W: Write> MethodWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub fn send(&mut self, message: &Message) -> Result<()> {
        self.sink.write_all(message.render().as_bytes())?;
        self.sink.flush()?;
        Ok(())
    }
}

/// One unit of progress from [AsyncMethodReader::step].
pub enum ControlStep {
    /// A complete message arrived.
    Message(Message),
    /// A line was consumed but the message is not complete yet.
    Line,
    /// The control channel closed.
    Eof,
}

/// Async message reader, pollable one line at a time from a select loop.
pub struct AsyncMethodReader<R> {
    lines: Lines<BufReader<R>>,
    partial: Vec<String>,
}

impl<R: AsyncRead + Unpin> AsyncMethodReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            lines: BufReader::new(source).lines(),
            partial: Vec::new(),
        }
    }

    /// Consume at most one line. Cancel-safe, so it can sit in a `select!`
    /// branch next to socket readiness.
    pub async fn step(&mut self) -> Result<ControlStep> {
        match self.lines.next_line().await? {
            None => Ok(ControlStep::Eof),
            Some(line) => {
                if line.is_empty() {
                    if self.partial.is_empty() {
                        Ok(ControlStep::Line)
                    } else {
                        let lines = std::mem::take(&mut self.partial);
                        Ok(ControlStep::Message(Message::from_lines(&lines)?))
                    }
                } else {
                    self.partial.push(line);
                    Ok(ControlStep::Line)
                }
            }
        }
    }

    /// Block until the next complete message. `None` means the channel closed.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            match self.step().await? {
                ControlStep::Message(message) => return Ok(Some(message)),
                ControlStep::Line => {}
                ControlStep::Eof => return Ok(None),
            }
        }
    }
}

/// Async message writer.
pub struct AsyncMethodWriter<W> {
    sink: W,
}

impl<W: AsyncWrite + Unpin> AsyncMethodWriter<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        self.sink.write_all(message.render().as_bytes()).await?;
        self.sink.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri_acquire() -> Result<()> {
        let text = "600 URI Acquire\n\
                    URI: http://ftp.debian.org/debian/dists/stable/Release\n\
                    Filename: /var/lib/apt/lists/partial/Release\n\
                    Last-Modified: Thu, 01 Jan 1970 00:00:05 GMT\n\
                    \n";
        let mut reader = MethodReader::new(text.as_bytes());
        let message = reader.next_message()?.unwrap();
        assert_eq!(message.code(), 600);

        let item = FetchItem::from_message(&message)?;
        assert_eq!(item.uri.host_str(), Some("ftp.debian.org"));
        assert_eq!(
            item.destination,
            PathBuf::from("/var/lib/apt/lists/partial/Release")
        );
        assert_eq!(item.last_modified, timefmt::from_unix(5));
        assert!(item.signed_by.is_none());

        assert!(reader.next_message()?.is_none());
        Ok(())
    }

    #[test]
    fn test_stray_blank_lines_skipped() -> Result<()> {
        let text = "\n\n600 URI Acquire\nURI: http://h/\nFilename: /tmp/f\n\n";
        let mut reader = MethodReader::new(text.as_bytes());
        assert_eq!(reader.next_message()?.unwrap().code(), 600);
        Ok(())
    }

    #[test]
    fn test_bad_tag_line() {
        let lines = vec!["600 URI Acquire".to_string(), "no colon here".to_string()];
        assert!(Message::from_lines(&lines).is_err());
    }

    #[test]
    fn test_render_uri_done() {
        let uri = Url::parse("http://h/f").unwrap();
        let mut res = FetchResult::new(uri, PathBuf::from("/tmp/f"));
        res.size = 5;
        res.last_modified = timefmt::from_unix(5);
        res.md5_hex = Some("5d41402abc4b2a76b9719d911017c592".to_string());

        let rendered = Message::uri_done(&res).render();
        assert!(rendered.starts_with("201 URI Done\n"));
        assert!(rendered.contains("Size: 5\n"));
        assert!(rendered.contains("MD5-Hash: 5d41402abc4b2a76b9719d911017c592\n"));
        assert!(rendered.contains("Last-Modified: Thu, 01 Jan 1970 00:00:05 GMT\n"));
        assert!(!rendered.contains("IMS-Hit"));
        assert!(rendered.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn test_async_reader_interleaved() -> Result<()> {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut reader = AsyncMethodReader::new(rx);

        tokio::io::AsyncWriteExt::write_all(&mut tx, b"601 Configuration\nConfig-Item: a=b\n")
            .await?;
        assert!(matches!(reader.step().await?, ControlStep::Line));
        assert!(matches!(reader.step().await?, ControlStep::Line));

        tokio::io::AsyncWriteExt::write_all(&mut tx, b"\n").await?;
        match reader.step().await? {
            ControlStep::Message(message) => {
                assert_eq!(message.code(), 601);
                assert_eq!(message.get("Config-Item"), Some("a=b"));
            }
            _ => panic!("expected a complete message"),
        }

        drop(tx);
        assert!(matches!(reader.step().await?, ControlStep::Eof));
        Ok(())
    }
}
