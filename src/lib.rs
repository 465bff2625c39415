// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
pub use device::{Device, StartUpdateError};
pub use manager::{CONFIG_TYPE_CPLD, InventoryRecord, PropertyValue, RequestError, SoftwareManager};
pub use software::{Activation, ApplyTime, ConfigError, Software, SoftwareConfig};
pub use transport::{ByteTransport, I2cDevice, TransportError};

pub mod cpld;
pub mod device;
pub mod host_power;
pub mod manager;
pub mod pldm;
pub mod software;
pub mod transport;
