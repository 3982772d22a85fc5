// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! OpenFan controller access over its USB serial link.
//!
//! The link carries no request ids, so a response is matched to its request
//! purely by order. [`Controller::run`] therefore holds a lock for the whole
//! write-then-read exchange.

pub mod dummy;
pub mod frame;

use frame::Command;
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortType, StopBits};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

pub use dummy::DummyController;

/// USB identifiers of the OpenFan controller (Raspberry Pi RP2040).
pub const USB_VID: u16 = 0x2e8a;
pub const USB_PID: u16 = 0x000a;

pub const BAUD_RATE: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Upper bound for one accumulated response (diagnostics included).
const RX_BUFFER_LEN: usize = frame::RX_CHUNK_LEN * 32;

/// Number of fan channels on the controller.
pub const FAN_COUNT: u8 = 10;

#[derive(Debug, Error)]
pub enum Error {
    #[error("device not found/plugged")]
    NotFound,
    #[error("invalid PWM value {0}")]
    InvalidPwm(u8),
    #[error("serial: {0}")]
    Serial(#[from] serialport::Error),
    #[error("{command}: {source}")]
    Io {
        command: Command,
        #[source]
        source: io::Error,
    },
    #[error("{command}: no response marker received")]
    MissingResponse { command: Command },
    #[error("{command}: invalid response format {payload:?}")]
    InvalidResponse { command: Command, payload: String },
}

pub type Result<T> = std::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A fan channel, 0-based (`fan1` in config is `FanId(0)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FanId(u8);

impl FanId {
    pub fn new(index: u8) -> Option<Self> {
        (index < FAN_COUNT).then_some(Self(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = FanId> {
        (0..FAN_COUNT).map(FanId)
    }
}

impl fmt::Display for FanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fan{}", self.0 + 1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub revision: String,
    pub mcu: String,
    pub usb: String,
    pub fan_channels_total: String,
    pub fan_channels_arch: String,
    pub fan_channels_driver: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub revision: String,
    pub protocol_version: String,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// An OpenFan controller behind any byte stream; a serial port in production.
pub struct Controller<P = Box<dyn SerialPort>> {
    port_name: String,
    link: Mutex<P>,
}

impl Controller {
    /// Find the first serial port exposed by an OpenFan and open it.
    pub fn open_auto() -> Result<Self> {
        let ports = serialport::available_ports()?;
        let port = ports
            .into_iter()
            .find_map(|p| match p.port_type {
                SerialPortType::UsbPort(info) if info.vid == USB_VID && info.pid == USB_PID => {
                    Some((p.port_name, info.serial_number))
                }
                _ => None,
            })
            .ok_or(Error::NotFound)?;

        log::info!(
            "Found OpenFan on {} - VID: {USB_VID:04x} - PID: {USB_PID:04x} - SN: {}",
            port.0,
            port.1.as_deref().unwrap_or("-")
        );
        Self::open(&port.0)
    }

    /// Open the serial port at `path` (115200 8N1) and clear stale bytes.
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(READ_TIMEOUT)
            .open()?;
        port.clear(ClearBuffer::All)?;
        Ok(Self::with_port(path, port))
    }
}

impl<P: Read + Write + Send> Controller<P> {
    pub fn with_port(name: &str, port: P) -> Self {
        Self {
            port_name: name.to_string(),
            link: Mutex::new(port),
        }
    }

    pub fn port(&self) -> &str {
        &self.port_name
    }

    /// Send one request and return the response payload, header stripped.
    ///
    /// `payload` must already be hex-encoded.
    pub fn run(&self, command: Command, payload: &[u8]) -> Result<Vec<u8>> {
        let request = frame::encode_request(command, payload);
        let io_err = |source| Error::Io { command, source };

        let mut port = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        port.write_all(&request).map_err(io_err)?;
        port.flush().map_err(io_err)?;

        let mut buf = Vec::with_capacity(frame::RX_CHUNK_LEN);
        let mut chunk = [0u8; frame::RX_CHUNK_LEN];
        loop {
            let n = match port.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => 0,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_err(e)),
            };
            buf.extend_from_slice(&chunk[..n]);
            if n < frame::RX_CHUNK_LEN || buf.len() >= RX_BUFFER_LEN {
                break;
            }
        }
        drop(port);

        let received = frame::split_received(&buf).ok_or(Error::MissingResponse { command })?;
        for line in frame::lines(received.diagnostics) {
            log::debug!("{}", String::from_utf8_lossy(line));
        }
        for line in frame::lines(received.response) {
            log::debug!("{}", String::from_utf8_lossy(line));
        }

        Ok(frame::response_payload(received.response).to_vec())
    }

    pub fn hardware_info(&self) -> Result<HardwareInfo> {
        let response = self.run(Command::HardwareInfo, &[])?;

        let mut hw = HardwareInfo::default();
        for (key, value) in frame::parse_key_values(&response) {
            match key.as_str() {
                "HW_REV" => hw.revision = value,
                "MCU" => hw.mcu = value,
                "USB" => hw.usb = value,
                "FAN_CHANNELS_TOTAL" => hw.fan_channels_total = value,
                "FAN_CHANNELS_ARCH" => hw.fan_channels_arch = value,
                "FAN_CHANNELS_DRIVER" => hw.fan_channels_driver = value,
                _ => {}
            }
        }
        Ok(hw)
    }

    pub fn firmware_info(&self) -> Result<FirmwareInfo> {
        let response = self.run(Command::FirmwareInfo, &[])?;

        let mut fw = FirmwareInfo::default();
        for (key, value) in frame::parse_key_values(&response) {
            match key.as_str() {
                "FW_REV" => fw.revision = value,
                "PROTOCOL_VERSION" => fw.protocol_version = value,
                _ => {}
            }
        }
        Ok(fw)
    }

    /// RPM of every fan channel the controller reports.
    pub fn rpms(&self) -> Result<BTreeMap<FanId, u16>> {
        let command = Command::FanAllGetRpm;
        let response = self.run(command, &[])?;

        let pairs = frame::parse_pair_list(&response).map_err(|entry| Error::InvalidResponse {
            command,
            payload: String::from_utf8_lossy(&entry).into_owned(),
        })?;

        let mut rpms = BTreeMap::new();
        for (index, rpm) in pairs {
            match u8::try_from(index).ok().and_then(FanId::new) {
                Some(fan) => {
                    rpms.insert(fan, rpm);
                }
                None => log::debug!("{command}: ignoring unknown fan index {index}"),
            }
        }
        Ok(rpms)
    }

    pub fn rpm(&self, fan: FanId) -> Result<u16> {
        let command = Command::FanGetRpm;
        let response = self.run(command, &frame::hex2(fan.index()))?;
        pair_value(command, &response)
    }

    /// Ask the controller to hold `rpm` on `fan`; returns the acknowledged target.
    pub fn set_rpm(&self, fan: FanId, rpm: u16) -> Result<u16> {
        let command = Command::FanSetRpm;
        let mut payload = frame::hex2(fan.index()).to_vec();
        payload.extend_from_slice(&frame::hex4(rpm));

        let response = self.run(command, &payload)?;
        pair_value(command, &response)
    }

    /// Set `fan` to `percent` (0-100); returns the acknowledged percentage.
    pub fn set_pwm(&self, fan: FanId, percent: u8) -> Result<u8> {
        if percent > 100 {
            return Err(Error::InvalidPwm(percent));
        }
        let command = Command::FanSetPwm;
        let mut payload = frame::hex2(fan.index()).to_vec();
        payload.extend_from_slice(&frame::hex2(frame::percent_to_device(percent)));

        let response = self.run(command, &payload)?;
        let value = pair_value(command, &response)?;
        device_percent(command, value, &response)
    }

    /// Set every fan to `percent` (0-100); returns the acknowledged percentage.
    pub fn set_all_pwm(&self, percent: u8) -> Result<u8> {
        if percent > 100 {
            return Err(Error::InvalidPwm(percent));
        }
        let command = Command::FanSetAllPwm;
        let payload = frame::hex2(frame::percent_to_device(percent));

        let response = self.run(command, &payload)?;
        let value = frame::parse_hex(&response).ok_or_else(|| invalid(command, &response))?;
        device_percent(command, value, &response)
    }
}

fn pair_value(command: Command, response: &[u8]) -> Result<u16> {
    frame::parse_pair(response)
        .map(|(_, v)| v)
        .ok_or_else(|| invalid(command, response))
}

fn device_percent(command: Command, value: u16, response: &[u8]) -> Result<u8> {
    u8::try_from(value)
        .map(frame::device_to_percent)
        .map_err(|_| invalid(command, response))
}

fn invalid(command: Command, response: &[u8]) -> Error {
    Error::InvalidResponse {
        command,
        payload: String::from_utf8_lossy(response).into_owned(),
    }
}
