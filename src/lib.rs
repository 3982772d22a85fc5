// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Closed-loop fan control for the OpenFan USB controller.

pub mod config;
pub mod controller;
pub mod curve;
pub mod hwmon;
pub mod monitor;
pub mod openfan;
pub mod protocol;
pub mod sse;
