// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Request/response framing for the OpenFan serial protocol.
//!
//! Requests are `'>' + CMD + PAYLOAD + "\r\n"`, every field written as
//! upper-case ASCII hex. Responses start at the first `'<'` in the received
//! bytes; anything before it is free-text diagnostics from the firmware.

use std::fmt;

pub const REQUEST_CHAR: u8 = b'>';
pub const RESPONSE_CHAR: u8 = b'<';
pub const END_CHAR: u8 = b'\n';
pub const ALT_END_CHAR: u8 = b'\r';

/// Size of a single serial read. A shorter read ends the transmission.
pub const RX_CHUNK_LEN: usize = 128;

/// Marker + 2-hex command echo + separator.
const RESPONSE_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    FanAllGetRpm,
    FanGetRpm,
    FanSetPwm,
    FanSetAllPwm,
    FanSetRpm,
    HardwareInfo,
    FirmwareInfo,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::FanAllGetRpm => 0x00,
            Command::FanGetRpm => 0x01,
            Command::FanSetPwm => 0x02,
            Command::FanSetAllPwm => 0x03,
            Command::FanSetRpm => 0x04,
            Command::HardwareInfo => 0x05,
            Command::FirmwareInfo => 0x06,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::FanAllGetRpm => "fan_all_get_rpm",
            Command::FanGetRpm => "fan_get_rpm",
            Command::FanSetPwm => "fan_set_pwm",
            Command::FanSetAllPwm => "fan_set_all_pwm",
            Command::FanSetRpm => "fan_set_rpm",
            Command::HardwareInfo => "hardware_info",
            Command::FirmwareInfo => "firmware_info",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Hex fields
// ---------------------------------------------------------------------------

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// One byte as two ASCII hex characters: 200 => `b"C8"`.
pub fn hex2(v: u8) -> [u8; 2] {
    [HEX[(v >> 4) as usize], HEX[(v & 0x0F) as usize]]
}

/// One 16-bit value as four ASCII hex characters: 1200 => `b"04B0"`.
pub fn hex4(v: u16) -> [u8; 4] {
    let [hi, lo] = v.to_be_bytes();
    let [a, b] = hex2(hi);
    let [c, d] = hex2(lo);
    [a, b, c, d]
}

/// Build the full request frame for `command` with an already hex-encoded payload.
pub fn encode_request(command: Command, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(REQUEST_CHAR);
    frame.extend_from_slice(&hex2(command.code()));
    frame.extend_from_slice(payload);
    frame.push(ALT_END_CHAR);
    frame.push(END_CHAR);
    frame
}

// ---------------------------------------------------------------------------
// PWM domain mapping
// ---------------------------------------------------------------------------

/// Percent (0-100) to device duty (0-255). The `+ 1` keeps a non-zero
/// percentage from rounding down to 0; the clamp handles 100%.
pub fn percent_to_device(percent: u8) -> u8 {
    (percent as u32 * 255 / 100 + 1).min(255) as u8
}

/// Device duty (0-255) to percent (0-100).
pub fn device_to_percent(device: u8) -> u8 {
    (device as u32 * 100 / 255) as u8
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// A received buffer split into firmware diagnostics and the response proper.
#[derive(Debug, PartialEq)]
pub struct Received<'a> {
    pub diagnostics: &'a [u8],
    pub response: &'a [u8],
}

/// Split at the first response marker. `None` when no marker was received.
pub fn split_received(buf: &[u8]) -> Option<Received<'_>> {
    let at = buf.iter().position(|&b| b == RESPONSE_CHAR)?;
    Some(Received {
        diagnostics: &buf[..at],
        response: &buf[at..],
    })
}

/// Strip the response header and surrounding whitespace.
pub fn response_payload(response: &[u8]) -> &[u8] {
    let body = if response.len() > RESPONSE_HEADER_LEN {
        &response[RESPONSE_HEADER_LEN..]
    } else {
        response
    };
    body.trim_ascii()
}

/// Non-empty CRLF-separated lines, for logging.
pub fn lines(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    split_crlf(buf).filter(|l| !l.is_empty())
}

fn split_crlf(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = Some(buf);
    std::iter::from_fn(move || {
        let cur = rest?;
        match cur.windows(2).position(|w| w == b"\r\n") {
            Some(i) => {
                rest = Some(&cur[i + 2..]);
                Some(&cur[..i])
            }
            None => {
                rest = None;
                Some(cur)
            }
        }
    })
}

/// Parse an ASCII hex field.
pub fn parse_hex(field: &[u8]) -> Option<u16> {
    let s = std::str::from_utf8(field).ok()?;
    if s.is_empty() {
        return None;
    }
    u16::from_str_radix(s, 16).ok()
}

/// `INDEX:VALUE` with both sides in hex.
pub fn parse_pair(payload: &[u8]) -> Option<(u16, u16)> {
    let mut kv = payload.split(|&b| b == b':');
    let (k, v) = (kv.next()?, kv.next()?);
    if kv.next().is_some() {
        return None;
    }
    Some((parse_hex(k)?, parse_hex(v)?))
}

/// `;`-separated `INDEX:VALUE` pairs. Entries without exactly one `:` are
/// skipped; entries with non-hex sides are an error.
pub fn parse_pair_list(payload: &[u8]) -> Result<Vec<(u16, u16)>, Vec<u8>> {
    let mut pairs = Vec::new();
    for entry in payload.split(|&b| b == b';') {
        if entry.iter().filter(|&&b| b == b':').count() != 1 {
            continue;
        }
        match parse_pair(entry) {
            Some(pair) => pairs.push(pair),
            None => return Err(entry.to_vec()),
        }
    }
    Ok(pairs)
}

/// CRLF-separated `KEY:VALUE` lines. Lines without exactly one `:` are skipped.
pub fn parse_key_values(payload: &[u8]) -> Vec<(String, String)> {
    split_crlf(payload)
        .filter_map(|line| {
            let mut kv = line.split(|&b| b == b':');
            let (k, v) = (kv.next()?, kv.next()?);
            if kv.next().is_some() {
                return None;
            }
            Some((
                String::from_utf8_lossy(k).into_owned(),
                String::from_utf8_lossy(v).into_owned(),
            ))
        })
        .collect()
}
