// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! PLDM Firmware Update package handling
//!
//! The module decodes the PLDM Firmware Update v1.0 package header format
//! and selects the component image applicable to one device. A package is a
//! self-describing container: a header enumerating firmware device ID
//! records (who the package applies to) and component image records (where
//! the image bytes live), followed by the raw component images.
//!
//! # Package layout
//! - UUID identifying the header format version (16 bytes)
//! - Header format revision, header size, release timestamp
//! - Component bitmap bit length, package version string
//! - Firmware device ID record area (count-prefixed)
//! - Component image information area (count-prefixed)
//! - CRC-32 over the header up to, but excluding, the checksum itself

use crc::{CRC_32_ISO_HDLC, Crc};

pub mod builder;
pub mod matcher;
pub mod package;

/// Header identifier UUID for PLDM Firmware Update package format v1.0
pub const PLDM_FWUP_V1_UUID: [u8; 16] = [
    0xF0, 0x18, 0x87, 0x8C, 0xCB, 0x7D, 0x49, 0x43, 0x98, 0x00, 0xA0, 0x2F, 0x05, 0x9A, 0xCA, 0x02,
];

/// Supported package header format revision
pub const PACKAGE_HEADER_REVISION: u8 = 0x01;

/// Descriptor type code for the IANA enterprise ID descriptor
pub const DESCRIPTOR_IANA_ENTERPRISE_ID: u16 = 0x0001;

/// Descriptor type code for vendor-defined descriptors
pub const DESCRIPTOR_VENDOR_DEFINED: u16 = 0xFFFF;

/// CRC-32 calculator for the package header checksum
///
/// The package format uses the reflected Ethernet polynomial, computed over
/// the header bytes up to the stored checksum.
pub(crate) const HEADER_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Package decoding error types
///
/// Any of these rejects the whole package; an update observing one moves
/// the software object to the `Invalid` activation state.
#[derive(thiserror::Error, Debug)]
pub enum PackageError {
    /// Package data ended inside the named field
    #[error("package data ends inside {0}")]
    Truncated(&'static str),

    /// The header identifier does not name a supported package format
    #[error("package header UUID does not match the PLDM firmware update v1 format")]
    UuidMismatch,

    /// The header format revision is not supported
    #[error("unsupported package header revision {0:#04X}")]
    UnsupportedRevision(u8),

    /// The declared header size does not fit the package data
    #[error("header size {header_size} exceeds package size {available}")]
    HeaderOutOfBounds {
        /// Header size declared in the package
        header_size: usize,
        /// Bytes actually available
        available: usize,
    },

    /// The component bitmap bit length is zero or not a multiple of 8
    #[error("invalid component bitmap bit length {0}")]
    BadBitmapLength(u16),

    /// A length-prefixed string contains invalid data
    #[error("malformed string in {0}")]
    BadString(&'static str),

    /// A vendor-defined descriptor does not contain a valid title block
    #[error("malformed vendor-defined descriptor")]
    BadVendorDescriptor,

    /// The stored header checksum does not match the computed one
    #[error("header checksum mismatch: stored {stored:#010X}, computed {computed:#010X}")]
    ChecksumMismatch {
        /// Checksum stored in the package header
        stored: u32,
        /// Checksum computed over the header bytes
        computed: u32,
    },

    /// A component image region lies outside the package data
    #[error("component {index} image region is out of bounds")]
    ComponentOutOfBounds {
        /// Index of the offending component image record
        index: usize,
    },
}

pub use matcher::{MatchError, MatchedComponent, match_component};
pub use package::{ComponentImageInfo, Descriptor, FirmwareDeviceIdRecord, Package};
