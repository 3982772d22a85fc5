// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! In-memory stand-in for the controller, for development without hardware.

use super::{FanId, FirmwareInfo, HardwareInfo};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

/// RPM reported by a fan driven at 100%.
const FULL_SPEED_RPM: f32 = 1500.0;

const NOT_AVAILABLE: &str = "n/a";

pub struct DummyController {
    pwms: Mutex<BTreeMap<FanId, u8>>,
}

impl Default for DummyController {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyController {
    pub fn new() -> Self {
        Self {
            pwms: Mutex::new(FanId::all().map(|f| (f, 0)).collect()),
        }
    }

    pub fn port(&self) -> &str {
        "x-testing"
    }

    pub fn hardware_info(&self) -> HardwareInfo {
        let na = || NOT_AVAILABLE.to_string();
        HardwareInfo {
            revision: na(),
            mcu: na(),
            usb: na(),
            fan_channels_total: na(),
            fan_channels_arch: na(),
            fan_channels_driver: na(),
        }
    }

    pub fn firmware_info(&self) -> FirmwareInfo {
        FirmwareInfo {
            revision: NOT_AVAILABLE.to_string(),
            protocol_version: NOT_AVAILABLE.to_string(),
        }
    }

    pub fn rpms(&self) -> BTreeMap<FanId, u16> {
        let pwms = self.pwms.lock().unwrap_or_else(PoisonError::into_inner);
        pwms.iter()
            .map(|(&fan, &pwm)| (fan, (FULL_SPEED_RPM * pwm as f32 / 100.0) as u16))
            .collect()
    }

    pub fn set_pwm(&self, fan: FanId, percent: u8) -> u8 {
        let mut pwms = self.pwms.lock().unwrap_or_else(PoisonError::into_inner);
        pwms.insert(fan, percent);
        percent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpm_follows_pwm() {
        let dummy = DummyController::new();
        let fan = FanId::new(2).unwrap();
        assert_eq!(dummy.rpms().len(), 10);
        assert_eq!(dummy.rpms()[&fan], 0);

        dummy.set_pwm(fan, 50);
        assert_eq!(dummy.rpms()[&fan], 750);
    }

    #[test]
    fn test_info_is_not_available() {
        let dummy = DummyController::new();
        assert_eq!(dummy.port(), "x-testing");
        assert_eq!(dummy.hardware_info().mcu, "n/a");
        assert_eq!(dummy.firmware_info().protocol_version, "n/a");
    }
}
