// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! HTTP/1.1 heads spoken over the daemon's Unix domain socket.
//!
//! Only what `/monitor` needs: the client sends a request head, the daemon
//! answers with a status line and headers, then streams events until either
//! side closes the connection.

use std::io::{self, BufRead};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Path of the live state stream.
pub const MONITOR_PATH: &str = "/monitor";

/// Header lines accepted before a request is rejected.
const MAX_HEADER_LINES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::MethodNotAllowed => 405,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
        }
    }
}

// ---------------------------------------------------------------------------
// Requests (client -> daemon)
// ---------------------------------------------------------------------------

/// Encode a `GET` request head for `path`.
pub fn encode_request(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: unix\r\nAccept: text/event-stream\r\n\r\n")
}

/// Parse `GET /monitor HTTP/1.1`.
pub fn parse_request_line(line: &str) -> Option<RequestLine> {
    let mut parts = line.trim_end().split(' ');
    let method = parts.next().filter(|m| !m.is_empty())?;
    let path = parts.next().filter(|p| p.starts_with('/'))?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") || parts.next().is_some() {
        return None;
    }
    Some(RequestLine {
        method: method.to_string(),
        path: path.to_string(),
    })
}

/// Read a request head, returning its request line. Headers are skipped.
///
/// `Ok(None)` means the head was malformed; EOF before the head ends is an error.
pub async fn read_request_head<R>(r: &mut R) -> io::Result<Option<RequestLine>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if r.read_line(&mut line).await? == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    let request = parse_request_line(&line);

    for _ in 0..MAX_HEADER_LINES {
        line.clear();
        if r.read_line(&mut line).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if line.trim_end().is_empty() {
            return Ok(request);
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Responses (daemon -> client)
// ---------------------------------------------------------------------------

/// Head of the event stream response. The body runs until the connection closes.
pub fn encode_stream_head() -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        Status::Ok.code(),
        Status::Ok.reason()
    )
}

/// A complete plain-text error response.
pub fn encode_error(status: Status, message: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{message}",
        status.code(),
        status.reason(),
        message.len()
    )
}

/// Parse `HTTP/1.1 200 OK` into its code and reason.
pub fn parse_status_line(line: &str) -> Option<(u16, String)> {
    let mut parts = line.trim_end().splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    let code = parts.next()?.parse().ok()?;
    let reason = parts.next().unwrap_or_default().to_string();
    Some((code, reason))
}

/// Read a response head, returning the status. Headers are skipped.
pub fn read_response_head<R: BufRead>(r: &mut R) -> io::Result<(u16, String)> {
    let mut line = String::new();
    if r.read_line(&mut line)? == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    let status = parse_status_line(&line).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid status line {:?}", line.trim_end()),
        )
    })?;

    loop {
        line.clear();
        if r.read_line(&mut line)? == 0 || line.trim_end().is_empty() {
            return Ok(status);
        }
    }
}
