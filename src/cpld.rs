// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! CPLD programming engines
//!
//! This module drives the vendor programming protocol of Lattice CPLDs over
//! the byte transport. Each supported chip family has its own engine; the
//! factory picks one from the configured chip model and wraps it in
//! [`CpldEngine`], which exposes the two operations the update orchestrator
//! needs: program a firmware image and read the running version.
//!
//! # Supported families
//! - XO2/XO3/XO3D: transparent-mode flash programming with 16-byte pages,
//!   busy polling and per-page read-back verification
//! - XO5: block/page programming of a CFG bank with read-back verification
//! - XO5 with command CRC: the XO5 protocol variant with CRC-16 framed
//!   commands and device-side SHA-384 verification
//! - XO5D: out-of-band framed command protocol with A/B customer images

use std::time::Duration;

use log::info;

use crate::cpld::jed::JedError;
use crate::transport::{ByteTransport, TransportError};

pub mod jed;
pub mod xo3;
pub mod xo5;
pub mod xo5_crc;
pub mod xo5d;

use xo3::Xo3Engine;
use xo5::Xo5Engine;
use xo5_crc::Xo5CrcEngine;
use xo5d::{OobStatus, Xo5dEngine};

/// Busy-flag polling period shared by the XO2/XO3 and XO5D protocols
pub(crate) const WAIT_BUSY_INTERVAL: Duration = Duration::from_millis(200);

/// Busy-flag polling attempts before giving up
pub(crate) const WAIT_BUSY_MAX_RETRY: u32 = 30;

/// Chip vendors with a programming engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum ChipVendor {
    /// Lattice Semiconductor
    Lattice,
}

/// Lattice chip families with distinct programming protocols
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChipFamily {
    /// MachXO2
    Xo2,
    /// MachXO3 (LF)
    Xo3,
    /// MachXO3D, dual configuration banks
    Xo3d,
    /// MachXO5
    Xo5,
    /// MachXO5 with the out-of-band update block
    Xo5d,
}

/// Configuration bank targeted by an update
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum CfgBank {
    /// Primary configuration bank
    #[default]
    #[strum(serialize = "CFG0")]
    Cfg0,
    /// Secondary configuration bank
    #[strum(serialize = "CFG1")]
    Cfg1,
}

#[derive(Debug)]
pub(crate) struct ChipInfo {
    pub model: &'static str,
    pub family: ChipFamily,
    /// Device ID returned by opcode 0xE0, families that report one
    pub device_id: Option<[u8; 4]>,
}

// Chip support table. Model strings use dashes; configuration sources
// using underscores are normalized before lookup.
pub(crate) const SUPPORTED_CHIPS: &[ChipInfo] = &[
    ChipInfo {
        model: "LCMXO2-4000HC",
        family: ChipFamily::Xo2,
        device_id: Some([0x01, 0x2B, 0xC0, 0x43]),
    },
    ChipInfo {
        model: "LCMXO3LF-2100C",
        family: ChipFamily::Xo3,
        device_id: Some([0x61, 0x2B, 0xB0, 0x43]),
    },
    ChipInfo {
        model: "LCMXO3LF-4300C",
        family: ChipFamily::Xo3,
        device_id: Some([0x61, 0x2B, 0xC0, 0x43]),
    },
    ChipInfo {
        model: "LCMXO3D-4300",
        family: ChipFamily::Xo3d,
        device_id: Some([0x01, 0x2E, 0x20, 0x43]),
    },
    ChipInfo {
        model: "LCMXO3D-9400",
        family: ChipFamily::Xo3d,
        device_id: Some([0x21, 0x2E, 0x30, 0x43]),
    },
    ChipInfo {
        model: "LFMXO5-25",
        family: ChipFamily::Xo5,
        device_id: None,
    },
    ChipInfo {
        model: "LFMXO5-15D",
        family: ChipFamily::Xo5d,
        device_id: None,
    },
];

pub(crate) fn chip_info(model: &str) -> Option<&'static ChipInfo> {
    let normalized = model.replace('_', "-");
    SUPPORTED_CHIPS
        .iter()
        .find(|chip| chip.model.eq_ignore_ascii_case(&normalized))
}

/// Programming protocol error types
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// Byte transport failure underneath a protocol step
    #[error("bus transport error")]
    Transport(#[from] TransportError),

    /// The firmware image could not be parsed or verified
    #[error("firmware image error")]
    Jed(#[from] JedError),

    /// The configured chip model has no programming engine
    #[error("unsupported chip model '{model}' for vendor {vendor}")]
    UnsupportedChip {
        /// Configured chip vendor
        vendor: ChipVendor,
        /// Configured chip model string
        model: String,
    },

    /// The device ID read from the chip does not match the configuration
    #[error("device id {actual:02X?} does not match the configured chip (expected {expected:02X?})")]
    DeviceIdMismatch {
        /// Device ID expected for the configured model
        expected: [u8; 4],
        /// Device ID read from the chip
        actual: [u8; 4],
    },

    /// The device stayed busy past the polling budget
    #[error("device stayed busy past the polling budget")]
    BusyTimeout,

    /// The status register reported not-ready or fail after an operation
    #[error("status register reports failure ({status:#04X})")]
    StatusFailed {
        /// Raw status register byte
        status: u8,
    },

    /// Read-back data does not match what was programmed
    #[error("read-back verify mismatch at byte {offset}")]
    VerifyMismatch {
        /// Absolute byte offset of the first mismatch
        offset: usize,
    },

    /// The device kept rejecting the command CRC
    #[error("command CRC rejected after {retries} attempts")]
    CrcRejected {
        /// Attempts made before giving up
        retries: u32,
    },

    /// The device-side digest does not match the programmed image
    #[error("device digest does not match the programmed image")]
    DigestMismatch,

    /// A framed command completed with a non-success status
    #[error("framed command failed with status {0}")]
    Framed(OobStatus),

    /// A response had an unexpected shape
    #[error("unexpected response: {0}")]
    BadResponse(&'static str),
}

/// Result type for protocol operations
pub type ResultProtocol<T> = Result<T, ProtocolError>;

/// Family-specific steps behind the shared programming template
///
/// Every engine implements the four phases; `program_firmware` runs them
/// in order. Steps report progress through the callback with strictly
/// non-decreasing checkpoint values.
pub(crate) trait ProgramSequence {
    async fn prepare_update(
        &mut self,
        image: &[u8],
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> ResultProtocol<()>;

    async fn do_erase(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()>;

    async fn do_update(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()>;

    async fn finish_update(&mut self, progress: &mut (dyn FnMut(u8) + Send)) -> ResultProtocol<()>;

    async fn read_user_code(&mut self) -> ResultProtocol<u32>;

    /// Run the full programming sequence
    async fn program_firmware(
        &mut self,
        image: &[u8],
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> ResultProtocol<()> {
        self.prepare_update(image, progress).await?;
        self.do_erase(progress).await?;
        self.do_update(progress).await?;
        self.finish_update(progress).await?;
        Ok(())
    }
}

/// Options applied when constructing an engine
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineOptions {
    /// Configuration bank to program
    pub target: CfgBank,
    /// Device advertises CRC-16 framed commands (XO5 protocol v2)
    pub command_crc: bool,
}

/// One device's programming engine, dispatched by chip family
#[derive(Debug)]
pub enum CpldEngine<T: ByteTransport> {
    /// XO2/XO3/XO3D transparent-mode engine
    Xo3(Xo3Engine<T>),
    /// XO5 block/page engine
    Xo5(Xo5Engine<T>),
    /// XO5 engine with CRC framing and SHA-384 verification
    Xo5Crc(Xo5CrcEngine<T>),
    /// XO5D out-of-band framed engine
    Xo5d(Xo5dEngine<T>),
}

impl<T: ByteTransport + Send> CpldEngine<T> {
    /// Create the engine for a configured chip
    ///
    /// Dispatches on the chip family from the support table. An XO5 chip
    /// advertising `command_crc` gets the CRC/SHA-384 protocol variant.
    ///
    /// # Errors
    /// [`ProtocolError::UnsupportedChip`] when the model is not in the
    /// support table.
    pub fn create(
        vendor: ChipVendor,
        model: &str,
        options: EngineOptions,
        transport: T,
    ) -> ResultProtocol<Self> {
        let info = chip_info(model).ok_or_else(|| ProtocolError::UnsupportedChip {
            vendor,
            model: model.to_owned(),
        })?;

        info!(
            "creating {} {} engine on {}",
            vendor,
            info.model,
            transport.identifier()
        );

        Ok(match info.family {
            ChipFamily::Xo2 | ChipFamily::Xo3 | ChipFamily::Xo3d => {
                Self::Xo3(Xo3Engine::new(transport, info, options.target))
            }
            ChipFamily::Xo5 if options.command_crc => {
                Self::Xo5Crc(Xo5CrcEngine::new(transport, info, options.target))
            }
            ChipFamily::Xo5 => Self::Xo5(Xo5Engine::new(transport, info, options.target)),
            ChipFamily::Xo5d => Self::Xo5d(Xo5dEngine::new(transport, info)),
        })
    }

    /// Chip model string this engine was created for
    #[must_use]
    pub fn chip_model(&self) -> &'static str {
        match self {
            Self::Xo3(engine) => engine.chip_model(),
            Self::Xo5(engine) => engine.chip_model(),
            Self::Xo5Crc(engine) => engine.chip_model(),
            Self::Xo5d(engine) => engine.chip_model(),
        }
    }

    /// Program a firmware image into the device
    ///
    /// # Arguments
    /// * `image` - The component image bytes (a JED file for the flash
    ///   families, the customer image blob for XO5D)
    /// * `progress` - Callback receiving non-decreasing checkpoints in
    ///   0..=100
    ///
    /// # Errors
    /// Any [`ProtocolError`]; the device is left untouched only when the
    /// failure happens before the erase phase.
    pub async fn update_firmware(
        &mut self,
        image: &[u8],
        progress: &mut (dyn FnMut(u8) + Send),
    ) -> ResultProtocol<()> {
        match self {
            Self::Xo3(engine) => engine.program_firmware(image, progress).await,
            Self::Xo5(engine) => engine.program_firmware(image, progress).await,
            Self::Xo5Crc(engine) => engine.program_firmware(image, progress).await,
            Self::Xo5d(engine) => engine.program_firmware(image, progress).await,
        }
    }

    /// Read the running version (user code) from the device
    ///
    /// # Errors
    /// Any [`ProtocolError`] raised by the family read sequence.
    pub async fn read_version(&mut self) -> ResultProtocol<u32> {
        match self {
            Self::Xo3(engine) => engine.read_user_code().await,
            Self::Xo5(engine) => engine.read_user_code().await,
            Self::Xo5Crc(engine) => engine.read_user_code().await,
            Self::Xo5d(engine) => engine.read_user_code().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChipFamily, ChipVendor, chip_info};

    #[test]
    fn test_chip_lookup_normalizes_underscores() {
        let info = chip_info("LCMXO3LF_4300C").unwrap();
        assert_eq!(info.model, "LCMXO3LF-4300C");
        assert_eq!(info.family, ChipFamily::Xo3);
    }

    #[test]
    fn test_unknown_chip_not_found() {
        assert!(chip_info("LCMXO9-1").is_none());
    }

    #[test]
    fn test_vendor_parses_case_insensitively() {
        assert_eq!("lattice".parse::<ChipVendor>().unwrap(), ChipVendor::Lattice);
        assert_eq!("Lattice".parse::<ChipVendor>().unwrap(), ChipVendor::Lattice);
    }
}
