// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! PLDM package construction
//!
//! Builds well-formed PLDM Firmware Update v1.0 packages from a device
//! record and component image description. The service itself only ever
//! consumes packages; this builder exists for fixtures in the test suites
//! and for bench tooling that needs a package without a vendor release.

use super::{
    DESCRIPTOR_IANA_ENTERPRISE_ID, DESCRIPTOR_VENDOR_DEFINED, HEADER_CRC, PACKAGE_HEADER_REVISION,
    PLDM_FWUP_V1_UUID,
};

const ASCII_STRING_TYPE: u8 = 0x01;

struct RecordSpec {
    vendor_iana: u32,
    compatible: String,
    applicable_components: Vec<usize>,
}

enum ComponentSpec {
    /// Image bytes placed directly after the header
    Inline { version: String, data: Vec<u8> },
    /// Explicit offset and size, no bytes emitted (for bounds testing)
    Located { version: String, offset: u32, size: u32 },
}

/// Builder assembling a complete package byte vector
pub struct PackageBuilder {
    package_version: String,
    component_bitmap_bit_length: u16,
    records: Vec<RecordSpec>,
    components: Vec<ComponentSpec>,
}

impl PackageBuilder {
    /// Start a package with the given package version string
    #[must_use]
    pub fn new(package_version: &str) -> Self {
        PackageBuilder {
            package_version: package_version.to_owned(),
            component_bitmap_bit_length: 8,
            records: Vec::new(),
            components: Vec::new(),
        }
    }

    /// Override the component bitmap bit length (multiple of 8)
    #[must_use]
    pub fn bitmap_bit_length(mut self, bits: u16) -> Self {
        self.component_bitmap_bit_length = bits;
        self
    }

    /// Add a firmware device ID record with an IANA enterprise ID
    /// descriptor and a vendor-defined compatible descriptor
    #[must_use]
    pub fn device_record(mut self, vendor_iana: u32, compatible: &str, applicable: &[usize]) -> Self {
        self.records.push(RecordSpec {
            vendor_iana,
            compatible: compatible.to_owned(),
            applicable_components: applicable.to_vec(),
        });
        self
    }

    /// Add a component image whose bytes follow the header
    #[must_use]
    pub fn component(mut self, version: &str, data: &[u8]) -> Self {
        self.components.push(ComponentSpec::Inline {
            version: version.to_owned(),
            data: data.to_vec(),
        });
        self
    }

    /// Add a component image record with an explicit location and no bytes
    #[must_use]
    pub fn component_at(mut self, version: &str, offset: u32, size: u32) -> Self {
        self.components.push(ComponentSpec::Located {
            version: version.to_owned(),
            offset,
            size,
        });
        self
    }

    /// Assemble the package
    ///
    /// # Panics
    /// Panics when string fields exceed their length prefixes; builder
    /// inputs are test fixtures, not untrusted data.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let record_area: Vec<Vec<u8>> = self
            .records
            .iter()
            .map(|record| encode_record(record, self.component_bitmap_bit_length))
            .collect();

        let component_area: Vec<Vec<u8>> = self
            .components
            .iter()
            .map(|component| encode_component(component, 0))
            .collect();

        let header_size = 36
            + self.package_version.len()
            + 1
            + record_area.iter().map(Vec::len).sum::<usize>()
            + 2
            + component_area.iter().map(Vec::len).sum::<usize>()
            + 4;

        // Assign inline component offsets sequentially after the header,
        // then re-encode the component area with the final locations.
        let mut next_offset = header_size as u32;
        let mut offsets = Vec::with_capacity(self.components.len());
        for component in &self.components {
            match component {
                ComponentSpec::Inline { data, .. } => {
                    offsets.push(next_offset);
                    next_offset += data.len() as u32;
                }
                ComponentSpec::Located { offset, .. } => offsets.push(*offset),
            }
        }

        let mut header = Vec::with_capacity(header_size);
        header.extend_from_slice(&PLDM_FWUP_V1_UUID);
        header.push(PACKAGE_HEADER_REVISION);
        header.extend_from_slice(&(header_size as u16).to_le_bytes());
        header.extend_from_slice(&[0u8; 13]);
        header.extend_from_slice(&self.component_bitmap_bit_length.to_le_bytes());
        header.push(ASCII_STRING_TYPE);
        header.push(self.package_version.len() as u8);
        header.extend_from_slice(self.package_version.as_bytes());

        header.push(self.records.len() as u8);
        for record in record_area {
            header.extend_from_slice(&record);
        }

        header.extend_from_slice(&(self.components.len() as u16).to_le_bytes());
        for (component, offset) in self.components.iter().zip(&offsets) {
            header.extend_from_slice(&encode_component(component, *offset));
        }

        let crc = HEADER_CRC.checksum(&header);
        header.extend_from_slice(&crc.to_le_bytes());
        debug_assert_eq!(header.len(), header_size);

        for component in &self.components {
            if let ComponentSpec::Inline { data, .. } = component {
                header.extend_from_slice(data);
            }
        }

        header
    }
}

fn encode_record(record: &RecordSpec, bitmap_bits: u16) -> Vec<u8> {
    let iana_descriptor = record.vendor_iana.to_le_bytes();

    let mut vendor_descriptor = Vec::with_capacity(2 + record.compatible.len());
    vendor_descriptor.push(ASCII_STRING_TYPE);
    vendor_descriptor.push(record.compatible.len() as u8);
    vendor_descriptor.extend_from_slice(record.compatible.as_bytes());

    let mut bitmap = vec![0u8; usize::from(bitmap_bits / 8)];
    for &component in &record.applicable_components {
        bitmap[component / 8] |= 1 << (component % 8);
    }

    let image_set_version = "set1";

    let record_length = 2 + 1 + 4 + 1 + 1 + 2
        + bitmap.len()
        + image_set_version.len()
        + (4 + iana_descriptor.len())
        + (4 + vendor_descriptor.len());

    let mut out = Vec::with_capacity(record_length);
    out.extend_from_slice(&(record_length as u16).to_le_bytes());
    out.push(2); // descriptor count
    out.extend_from_slice(&0u32.to_le_bytes()); // device update option flags
    out.push(ASCII_STRING_TYPE);
    out.push(image_set_version.len() as u8);
    out.extend_from_slice(&0u16.to_le_bytes()); // firmware device package data length
    out.extend_from_slice(&bitmap);
    out.extend_from_slice(image_set_version.as_bytes());

    out.extend_from_slice(&DESCRIPTOR_IANA_ENTERPRISE_ID.to_le_bytes());
    out.extend_from_slice(&(iana_descriptor.len() as u16).to_le_bytes());
    out.extend_from_slice(&iana_descriptor);

    out.extend_from_slice(&DESCRIPTOR_VENDOR_DEFINED.to_le_bytes());
    out.extend_from_slice(&(vendor_descriptor.len() as u16).to_le_bytes());
    out.extend_from_slice(&vendor_descriptor);

    out
}

fn encode_component(component: &ComponentSpec, offset: u32) -> Vec<u8> {
    let (version, offset, size) = match component {
        ComponentSpec::Inline { version, data } => (version, offset, data.len() as u32),
        ComponentSpec::Located {
            version,
            offset,
            size,
        } => (version, *offset, *size),
    };

    let mut out = Vec::with_capacity(18 + version.len());
    out.extend_from_slice(&0x000Au16.to_le_bytes()); // classification: firmware
    out.extend_from_slice(&0u16.to_le_bytes()); // identifier
    out.extend_from_slice(&0u32.to_le_bytes()); // comparison stamp
    out.extend_from_slice(&0u16.to_le_bytes()); // options
    out.extend_from_slice(&0u16.to_le_bytes()); // requested activation method
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.push(ASCII_STRING_TYPE);
    out.push(version.len() as u8);
    out.extend_from_slice(version.as_bytes());
    out
}
