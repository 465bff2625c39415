// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! Component image selection
//!
//! Given a parsed package and one device's identity, find the component
//! image that package declares applicable to it. A firmware device ID
//! record matches when its IANA enterprise ID descriptor equals the
//! device's vendor IANA and its vendor-defined descriptor title equals the
//! device's compatible string; record order in the package decides ties.

use log::{debug, error};

use super::{
    DESCRIPTOR_IANA_ENTERPRISE_ID, DESCRIPTOR_VENDOR_DEFINED,
    package::{Descriptor, FirmwareDeviceIdRecord, Package},
};

/// Matching error types
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MatchError {
    /// No firmware device ID record applies to the device
    #[error("package does not apply to this device")]
    NotApplicable,

    /// A matching record references a component index the package lacks
    #[error("applicable component {component} is out of range")]
    ApplicableOutOfRange {
        /// Component index named by the record
        component: usize,
    },
}

/// The component image selected for a device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchedComponent<'a> {
    /// Image offset from the start of the package
    pub offset: usize,
    /// Image size in bytes
    pub size: usize,
    /// Component version string
    pub version: &'a str,
}

/// Select the component image for a device
///
/// Iterates the firmware device ID records in package order and returns
/// the component named by the first record whose descriptors match both
/// the vendor IANA and the compatible string.
///
/// # Errors
/// [`MatchError::NotApplicable`] when no record matches (or a matching
/// record names no components); [`MatchError::ApplicableOutOfRange`] when
/// a matching record points past the component image table.
pub fn match_component<'a>(
    package: &'a Package,
    vendor_iana: u32,
    compatible: &str,
) -> Result<MatchedComponent<'a>, MatchError> {
    for record in &package.fw_device_id_records {
        if !record_matches(record, vendor_iana, compatible) {
            continue;
        }

        let Some(&component_index) = record.applicable_components.first() else {
            error!("matching device record names no applicable component");
            return Err(MatchError::NotApplicable);
        };

        let Some(component) = package.component_images.get(component_index) else {
            error!("applicable component {component_index} is out of bounds");
            return Err(MatchError::ApplicableOutOfRange {
                component: component_index,
            });
        };

        debug!(
            "matched component {component_index} version {:?} for IANA {vendor_iana:#010X}, compatible {compatible:?}",
            component.version
        );

        return Ok(MatchedComponent {
            offset: component.location_offset as usize,
            size: component.size as usize,
            version: &component.version,
        });
    }

    debug!("no device record matched IANA {vendor_iana:#010X}, compatible {compatible:?}");
    Err(MatchError::NotApplicable)
}

fn record_matches(record: &FirmwareDeviceIdRecord, vendor_iana: u32, compatible: &str) -> bool {
    matches_iana(record, vendor_iana) && matches_compatible(record, compatible)
}

fn matches_iana(record: &FirmwareDeviceIdRecord, vendor_iana: u32) -> bool {
    let Some(Descriptor::Raw(data)) = record.descriptors.get(&DESCRIPTOR_IANA_ENTERPRISE_ID) else {
        return false;
    };

    let Ok(bytes) = <[u8; 4]>::try_from(data.as_slice()) else {
        error!("IANA enterprise ID descriptor has wrong size ({})", data.len());
        return false;
    };

    u32::from_le_bytes(bytes) == vendor_iana
}

fn matches_compatible(record: &FirmwareDeviceIdRecord, compatible: &str) -> bool {
    match record.descriptors.get(&DESCRIPTOR_VENDOR_DEFINED) {
        Some(Descriptor::VendorDefined { title, .. }) => title == compatible,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use crate::pldm::builder::PackageBuilder;
    use crate::pldm::package::Package;

    use super::{MatchError, match_component};

    const IANA: u32 = 0x03020100;
    const COMPATIBLE: &str = "com.example.Board";

    #[test]
    fn test_matching_device_selects_component() {
        let bytes = PackageBuilder::new("v1")
            .device_record(IANA, COMPATIBLE, &[0])
            .component("c1", &[0xAB, 0xBA, 0xCD, 0xEF])
            .build();
        let package = Package::parse(&bytes).unwrap();

        let matched = match_component(&package, IANA, COMPATIBLE).unwrap();
        assert_eq!(matched.size, 4);
        assert_eq!(matched.version, "c1");
        assert_eq!(&bytes[matched.offset..matched.offset + 4], &[0xAB, 0xBA, 0xCD, 0xEF]);
    }

    #[test]
    fn test_non_matching_compatible() {
        let bytes = PackageBuilder::new("v1")
            .device_record(IANA, COMPATIBLE, &[0])
            .component("c1", &[1, 2, 3, 4])
            .build();
        let package = Package::parse(&bytes).unwrap();

        assert_eq!(
            match_component(&package, IANA, "com.example.Other"),
            Err(MatchError::NotApplicable)
        );
    }

    #[test]
    fn test_non_matching_iana() {
        let bytes = PackageBuilder::new("v1")
            .device_record(IANA, COMPATIBLE, &[0])
            .component("c1", &[1, 2, 3, 4])
            .build();
        let package = Package::parse(&bytes).unwrap();

        assert_eq!(
            match_component(&package, 0x0000A015, COMPATIBLE),
            Err(MatchError::NotApplicable)
        );
    }

    #[test]
    fn test_first_matching_record_wins_regardless_of_others() {
        let front = PackageBuilder::new("v1")
            .device_record(IANA, COMPATIBLE, &[1])
            .device_record(0x11111111, "com.example.Other", &[0])
            .component("other", &[9, 9])
            .component("ours", &[1, 2, 3, 4])
            .build();
        let back = PackageBuilder::new("v1")
            .device_record(0x11111111, "com.example.Other", &[0])
            .device_record(IANA, COMPATIBLE, &[1])
            .component("other", &[9, 9])
            .component("ours", &[1, 2, 3, 4])
            .build();

        for bytes in [front, back] {
            let package = Package::parse(&bytes).unwrap();
            let matched = match_component(&package, IANA, COMPATIBLE).unwrap();
            assert_eq!(matched.version, "ours");
        }
    }

    #[test]
    fn test_out_of_range_component_detected() {
        // Record claims component 5; only one component exists. The bitmap
        // needs enough bits for index 5, and parsing succeeds because the
        // package itself is well formed.
        let bytes = PackageBuilder::new("v1")
            .device_record(IANA, COMPATIBLE, &[5])
            .component("c1", &[1, 2, 3, 4])
            .build();
        let package = Package::parse(&bytes).unwrap();

        assert_eq!(
            match_component(&package, IANA, COMPATIBLE),
            Err(MatchError::ApplicableOutOfRange { component: 5 })
        );
    }

    #[test]
    fn test_record_without_components_is_not_applicable() {
        let bytes = PackageBuilder::new("v1")
            .device_record(IANA, COMPATIBLE, &[])
            .component("c1", &[1, 2, 3, 4])
            .build();
        let package = Package::parse(&bytes).unwrap();

        assert_eq!(
            match_component(&package, IANA, COMPATIBLE),
            Err(MatchError::NotApplicable)
        );
    }
}
