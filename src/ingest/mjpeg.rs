//! MJPEG-over-HTTP frame source.
//!
//! `MjpegClient` speaks just enough HTTP/1.1 to request a
//! `multipart/x-mixed-replace` stream and split it into JPEG payloads:
//! - send a GET (with Basic auth when the URL carries user info)
//! - read response headers up to the blank line and extract the boundary token
//! - per part: skip to the boundary line, read part headers, read `Content-Length` bytes
//!
//! `MjpegSource` wraps the client, decodes payloads and keeps the raw bytes on
//! each frame so recordings can store them without re-encoding.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use chrono::Local;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use url::Url;

use super::{decode_next, FrameSource, SourceConfig, SourceInfo, SourceStats};
use crate::error::StreamError;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const MAX_HEADER_LINES: usize = 256;
/// Longest header, boundary or preamble line accepted, terminator included.
const MAX_LINE_BYTES: usize = 8 * 1024;
/// Lines skipped while looking for the next boundary.
const MAX_SKIPPED_LINES: usize = 1024;

// ----------------------------------------------------------------------------
// Wire parsing
// ----------------------------------------------------------------------------

/// Build the GET request for `url`.
pub fn build_request(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("mjpeg url missing host"))?;
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    let mut lines = vec![format!("GET {} HTTP/1.1", target), format!("Host: {}", host)];
    if !url.username().is_empty() {
        let credentials = format!("{}:{}", url.username(), url.password().unwrap_or(""));
        let token = base64::engine::general_purpose::STANDARD.encode(credentials);
        lines.push(format!("Authorization: Basic {}", token));
    }
    Ok(lines.join("\r\n") + "\r\n\r\n")
}

fn io_error(err: io::Error, what: &'static str) -> anyhow::Error {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            anyhow::Error::new(StreamError::Timeout).context(what)
        }
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => {
            anyhow::Error::new(StreamError::SourceExhausted).context(format!("{}: {}", what, err))
        }
        _ => anyhow::Error::new(err).context(what),
    }
}

/// Read one line without its terminator. `None` at end of stream.
///
/// Lines longer than `MAX_LINE_BYTES` are a protocol error; at most that many bytes
/// are buffered.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut raw = Vec::new();
    let read = io::Read::take(&mut *reader, MAX_LINE_BYTES as u64)
        .read_until(b'\n', &mut raw)
        .map_err(|e| io_error(e, "read mjpeg line"))?;
    if read == 0 {
        return Ok(None);
    }
    if read == MAX_LINE_BYTES && raw.last() != Some(&b'\n') {
        return Err(StreamError::protocol(format!(
            "line longer than {} bytes",
            MAX_LINE_BYTES
        ))
        .into());
    }
    let line = String::from_utf8_lossy(&raw);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    Some((name.trim(), value.trim()))
}

/// Read response headers up to the blank line and return the multipart boundary.
pub fn read_boundary<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut content_type: Option<String> = None;
    let mut first = true;
    for _ in 0..MAX_HEADER_LINES {
        let Some(line) = read_line(reader)? else {
            break;
        };
        if line.trim().is_empty() {
            break;
        }
        if first && line.starts_with("HTTP/") {
            let status = line.split_whitespace().nth(1).unwrap_or("");
            if status != "200" {
                return Err(StreamError::protocol(format!("unexpected response '{}'", line)).into());
            }
        }
        first = false;
        if let Some((name, value)) = header(&line) {
            if name.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.to_string());
            }
        }
    }

    let content_type =
        content_type.ok_or_else(|| StreamError::protocol("cannot find content-type"))?;
    parse_boundary(&content_type)
        .ok_or_else(|| StreamError::protocol(format!("cannot parse boundary from '{}'", content_type)).into())
}

/// Extract the `boundary=` parameter of a Content-Type value.
pub fn parse_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Read part headers up to the blank line and return `Content-Length`.
pub fn read_part_length<R: BufRead>(reader: &mut R) -> Result<usize> {
    let mut length = None;
    for _ in 0..MAX_HEADER_LINES {
        let Some(line) = read_line(reader)? else {
            return Err(StreamError::SourceExhausted.into());
        };
        if line.trim().is_empty() {
            return length.ok_or_else(|| StreamError::protocol("part has no content-length").into());
        }
        if let Some((name, value)) = header(&line) {
            if name.to_ascii_lowercase().contains("content-length") {
                let parsed = value
                    .parse::<usize>()
                    .map_err(|_| StreamError::protocol(format!("bad content-length '{}'", value)))?;
                length = Some(parsed);
            }
        }
    }
    Err(StreamError::protocol("too many part header lines").into())
}

/// Skip to the next line containing `boundary`, then read the part's length.
pub fn next_part_length<R: BufRead>(reader: &mut R, boundary: &str) -> Result<usize> {
    for _ in 0..MAX_SKIPPED_LINES {
        let Some(line) = read_line(reader)? else {
            return Err(StreamError::SourceExhausted.into());
        };
        if line.contains(boundary) {
            return read_part_length(reader);
        }
    }
    Err(StreamError::protocol(format!(
        "no boundary '{}' within {} lines",
        boundary, MAX_SKIPPED_LINES
    ))
    .into())
}

// ----------------------------------------------------------------------------
// MjpegClient
// ----------------------------------------------------------------------------

/// Multipart JPEG reader over any buffered byte stream.
///
/// Owns its reader; for network streams dropping the client closes the socket.
pub struct MjpegClient<R> {
    reader: R,
    boundary: String,
}

impl MjpegClient<BufReader<TcpStream>> {
    /// Connect, send the request and read the response headers.
    pub fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).context("parse mjpeg url")?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("mjpeg url missing host"))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let addr = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}:{}", host, port))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}:{}", host, port))?;

        let mut stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| io_error(e, "connect to mjpeg stream"))?;
        stream
            .set_read_timeout(Some(timeout))
            .context("set mjpeg read timeout")?;
        stream
            .set_write_timeout(Some(timeout))
            .context("set mjpeg write timeout")?;
        stream
            .write_all(build_request(&url)?.as_bytes())
            .map_err(|e| io_error(e, "send mjpeg request"))?;

        Self::from_reader(BufReader::new(stream))
    }
}

impl<R: BufRead> MjpegClient<R> {
    /// Read response headers from an already-open stream.
    pub fn from_reader(mut reader: R) -> Result<Self> {
        let boundary = read_boundary(&mut reader)?;
        Ok(Self { reader, boundary })
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Next JPEG payload, undecoded.
    pub fn read_jpeg(&mut self) -> Result<Vec<u8>> {
        let length = next_part_length(&mut self.reader, &self.boundary)?;
        if length > MAX_JPEG_BYTES {
            return Err(StreamError::protocol(format!(
                "part of {} bytes exceeds {} byte limit",
                length, MAX_JPEG_BYTES
            ))
            .into());
        }
        let mut payload = vec![0u8; length];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| io_error(e, "read mjpeg payload"))?;
        Ok(payload)
    }
}

// ----------------------------------------------------------------------------
// MjpegSource
// ----------------------------------------------------------------------------

/// HTTP MJPEG frame source.
pub struct MjpegSource {
    config: SourceConfig,
    client: Option<MjpegClient<BufReader<TcpStream>>>,
    /// First frame, read during `connect` to learn the resolution.
    pending: Option<Frame>,
    info: SourceInfo,
    frame_count: u64,
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
}

impl MjpegSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            client: None,
            pending: None,
            info: SourceInfo::default(),
            frame_count: 0,
            connected_at: None,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn read_decoded(&mut self) -> Result<Frame> {
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| anyhow!("mjpeg source not connected; call connect() first"))?;
        let (jpeg, image) = decode_next("MjpegSource", || client.read_jpeg(), |jpeg: &Vec<u8>| {
            Ok(image::load_from_memory(jpeg)?.into_rgb8())
        })?;
        Ok(Frame::new(image, Local::now()).with_jpeg(jpeg))
    }

    fn record(&mut self, result: Result<Frame>) -> Result<Frame> {
        match result {
            Ok(frame) => {
                self.frame_count += 1;
                self.last_frame_at = Some(Instant::now());
                self.last_error = None;
                Ok(frame)
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }
}

impl FrameSource for MjpegSource {
    fn connect(&mut self) -> Result<()> {
        let client = MjpegClient::connect(&self.config.url, self.config.timeout)?;
        log::info!(
            "MjpegSource: connected to {} (boundary '{}')",
            self.config.url,
            client.boundary()
        );
        self.client = Some(client);
        self.connected_at = Some(Instant::now());

        let first = self.read_decoded()?;
        self.info = SourceInfo {
            width: first.width(),
            height: first.height(),
            fps: self.config.fps,
        };
        self.pending = Some(first);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let result = match self.pending.take() {
            Some(frame) => Ok(frame),
            None => self.read_decoded(),
        };
        self.record(result)
    }

    fn info(&self) -> SourceInfo {
        self.info
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let grace = self.config.timeout.max(Duration::from_secs(2));
        match self.last_frame_at {
            Some(last) => last.elapsed() <= grace,
            None => connected_at.elapsed() <= grace,
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.url.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
