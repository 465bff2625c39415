// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! Process-level software manager
//!
//! The manager consumes the set of configured devices from platform
//! inventory (handed in as property maps), constructs a [`Device`] with
//! its programming engine for each valid entry, and serves update requests
//! addressed by device object path. Invalid or incomplete entries are
//! skipped with an error log; the rest of the fleet keeps working.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::sync::Arc;

use log::{debug, error, info};
use serde::Deserialize;

use crate::cpld::{CfgBank, ChipVendor, CpldEngine, EngineOptions};
use crate::device::{Device, StartUpdateError};
use crate::host_power::HostPower;
use crate::software::{ApplyTime, ConfigError, SoftwareConfig};
use crate::transport::{ByteTransport, I2cDevice, TransportError};

/// Configuration type handled by this service
pub const CONFIG_TYPE_CPLD: &str = "CPLDFirmware";

const CONFIG_INTERFACE_PREFIX: &str = "xyz.openbmc_project.Configuration.";
const SERVICE_NAME_PREFIX: &str = "xyz.openbmc_project.Software.";

/// One typed property value from an inventory entry
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean property
    Bool(bool),
    /// Unsigned integer property
    U64(u64),
    /// String property
    String(String),
}

impl PropertyValue {
    fn as_u64(&self) -> Option<u64> {
        match self {
            PropertyValue::U64(value) => Some(*value),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(value) => Some(value),
            _ => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

/// One configured device as discovered by platform inventory
#[derive(Clone, Debug, Deserialize)]
pub struct InventoryRecord {
    /// Inventory object path of the device
    pub object_path: String,
    /// Configuration interface carrying the properties
    pub interface: String,
    /// Property map of the configuration interface
    pub properties: BTreeMap<String, PropertyValue>,
}

impl InventoryRecord {
    fn required_u64(&self, name: &'static str) -> Result<u64, ConfigError> {
        self.properties
            .get(name)
            .and_then(PropertyValue::as_u64)
            .ok_or(ConfigError::MissingProperty(name))
    }

    fn required_str(&self, name: &'static str) -> Result<&str, ConfigError> {
        self.properties
            .get(name)
            .and_then(PropertyValue::as_str)
            .ok_or(ConfigError::MissingProperty(name))
    }
}

/// Update request error types at the manager entry point
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    /// No device is configured at the given object path
    #[error("no device at object path '{0}'")]
    UnknownDevice(String),

    /// The device rejected the request
    #[error(transparent)]
    Rejected(#[from] StartUpdateError),
}

type TransportOpener<T> = Box<dyn Fn(u16, u8) -> Result<T, TransportError> + Send + Sync>;

/// Process-level coordinator owning all device orchestrators
pub struct SoftwareManager<T: ByteTransport + Send + 'static> {
    service_suffix: String,
    open_transport: TransportOpener<T>,
    host_power: Option<Arc<dyn HostPower>>,
    devices: HashMap<String, Device<T>>,
}

impl SoftwareManager<I2cDevice> {
    /// Create a manager whose devices sit on local I2C buses
    #[must_use]
    pub fn new(service_suffix: &str) -> Self {
        Self::with_transport(service_suffix, Box::new(I2cDevice::open))
    }
}

impl<T: ByteTransport + Send + 'static> SoftwareManager<T> {
    /// Create a manager with a custom transport opener
    #[must_use]
    pub fn with_transport(service_suffix: &str, open_transport: TransportOpener<T>) -> Self {
        debug!("initialized software manager");
        SoftwareManager {
            service_suffix: service_suffix.to_owned(),
            open_transport,
            host_power: None,
            devices: HashMap::new(),
        }
    }

    /// Wire in the platform power service handle
    pub fn set_host_power(&mut self, host_power: Arc<dyn HostPower>) {
        self.host_power = Some(host_power);
    }

    /// Service identity published once enumeration completes
    #[must_use]
    pub fn service_name(&self) -> String {
        format!("{SERVICE_NAME_PREFIX}{}", self.service_suffix)
    }

    /// Number of configured devices
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Look up a device by its inventory object path
    #[must_use]
    pub fn device(&self, object_path: &str) -> Option<&Device<T>> {
        self.devices.get(object_path)
    }

    /// Consume inventory records and construct the device fleet
    ///
    /// Records whose interface does not carry a supported configuration
    /// type are ignored; records with missing or invalid properties are
    /// skipped with an error log. After enumeration the service identity
    /// is published.
    pub async fn init_devices(&mut self, records: &[InventoryRecord]) {
        for record in records {
            let Some(config_type) = record.interface.strip_prefix(CONFIG_INTERFACE_PREFIX) else {
                continue;
            };
            if config_type != CONFIG_TYPE_CPLD {
                continue;
            }

            debug!(
                "[config] found configuration interface at {}",
                record.object_path
            );

            match self.init_device(record).await {
                Ok(()) => {}
                Err(err) => {
                    error!("skipping device at {}: {err}", record.object_path);
                }
            }
        }

        info!("[config] done with initial configuration");
        info!("publishing service identity {}", self.service_name());
    }

    async fn init_device(&mut self, record: &InventoryRecord) -> Result<(), ConfigError> {
        let vendor_iana = record.required_u64("VendorIANA")? as u32;
        let compatible = record.required_str("Compatible")?;
        let config_type = record.required_str("Type")?;
        let config_name = record.required_str("Name")?;

        let bus = record.required_u64("Bus")? as u16;
        let address = record.required_u64("Address")? as u8;
        let chip_vendor = record.required_str("ChipVendor")?;
        let chip_model = record.required_str("ChipFamily")?;

        let config = SoftwareConfig::new(
            &record.object_path,
            vendor_iana,
            compatible,
            config_type,
            config_name,
        )?;

        let vendor: ChipVendor = chip_vendor
            .parse()
            .map_err(|_| ConfigError::UnknownVendor(chip_vendor.to_owned()))?;

        let target = record
            .properties
            .get("Target")
            .and_then(PropertyValue::as_str)
            .and_then(|value| value.parse::<CfgBank>().ok())
            .unwrap_or_default();
        let command_crc = record
            .properties
            .get("CommandCrc")
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false);

        debug!(
            "CPLD device {chip_vendor} - {chip_model} on bus {bus} at address {address:#04X}"
        );

        let transport = (self.open_transport)(bus, address)?;

        let engine = CpldEngine::create(
            vendor,
            chip_model,
            EngineOptions {
                target,
                command_crc,
            },
            transport,
        )?;

        let allowed_apply_times: BTreeSet<ApplyTime> =
            [ApplyTime::Immediate, ApplyTime::OnReset].into();

        let device = Device::new(
            config,
            allowed_apply_times,
            engine,
            self.host_power.clone(),
        );

        let version = {
            let engine = device.engine();
            let mut engine = engine.lock().await;
            match engine.read_version().await {
                Ok(user_code) => format!("{user_code:08x}"),
                Err(err) => {
                    error!("could not read the running version: {err}");
                    "unknown".to_owned()
                }
            }
        };
        device.initialize_current(&version);

        self.devices.insert(record.object_path.clone(), device);
        Ok(())
    }

    /// Update-request entry point
    ///
    /// # Errors
    /// [`RequestError::UnknownDevice`] for an unconfigured path; admission
    /// errors from the device pass through unchanged.
    pub fn start_update(
        &self,
        object_path: &str,
        image: &File,
        apply_time: ApplyTime,
    ) -> Result<String, RequestError> {
        let device = self
            .devices
            .get(object_path)
            .ok_or_else(|| RequestError::UnknownDevice(object_path.to_owned()))?;

        info!("requesting device update at {object_path}");
        Ok(device.start_update(image, apply_time)?)
    }

    /// Wait for every in-flight update task to finish
    pub async fn wait_for_updates(&self) {
        for device in self.devices.values() {
            device.wait_for_update().await;
        }
    }
}
