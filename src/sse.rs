// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Event stream framing for `/monitor`.
//!
//! Each event is a JSON payload followed by an empty line (`"\n\n"`).

use std::io::{self, Read};
use thiserror::Error;

/// Upper bound for a single event, delimiter included.
pub const MAX_EVENT_LEN: usize = 512 << 10;

/// The event could not be read completely. `partial` holds every byte
/// received before the failure, so callers can tell a closed stream (empty)
/// from a truncated event.
#[derive(Debug, Error)]
#[error("read event: {source}")]
pub struct ReadError {
    pub partial: Vec<u8>,
    #[source]
    pub source: io::Error,
}

/// Frame a payload as one event.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut event = Vec::with_capacity(payload.len() + 2);
    event.extend_from_slice(payload);
    event.extend_from_slice(b"\n\n");
    event
}

/// Read one event and return its payload without the trailing newlines.
///
/// Reads byte by byte, so `r` should be buffered.
pub fn read_event<R: Read>(r: &mut R) -> Result<Vec<u8>, ReadError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    let mut line_feeds = 0;

    loop {
        match r.read(&mut byte) {
            Ok(0) => {
                return Err(ReadError {
                    partial: buf,
                    source: io::ErrorKind::UnexpectedEof.into(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(ReadError { partial: buf, source }),
        }

        if byte[0] == b'\n' {
            line_feeds += 1;
            if line_feeds == 2 {
                buf.pop();
                return Ok(buf);
            }
        } else {
            line_feeds = 0;
        }

        if buf.len() + 1 >= MAX_EVENT_LEN {
            return Err(ReadError {
                partial: buf,
                source: io::Error::new(io::ErrorKind::InvalidData, "event too large"),
            });
        }
        buf.push(byte[0]);
    }
}
