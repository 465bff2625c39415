// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! PLDM Firmware Update package header parser

use std::collections::BTreeMap;

use log::{debug, trace};

use super::{
    DESCRIPTOR_VENDOR_DEFINED, HEADER_CRC, PACKAGE_HEADER_REVISION, PLDM_FWUP_V1_UUID, PackageError,
};

/// Result type for package decoding
pub type ResultPackage<T> = Result<T, PackageError>;

// Fixed-size fields preceding the package version string: UUID (16),
// revision (1), header size (2), release timestamp (13), component bitmap
// bit length (2), version string type (1), version string length (1).
const FIXED_HEADER_LEN: usize = 36;

// Smallest well-formed header: fixed fields, empty version string, empty
// record areas and the trailing checksum.
const MIN_HEADER_LEN: usize = FIXED_HEADER_LEN + 1 + 2 + 4;

/// One descriptor attached to a firmware device ID record
///
/// Descriptor type `0xFFFF` carries a vendor-defined title naming the
/// compatible hardware; every other type keeps its raw payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    /// Descriptor payload kept as raw bytes
    Raw(Vec<u8>),
    /// Vendor-defined descriptor split into title and trailing data
    VendorDefined {
        /// Vendor-defined descriptor title (the "compatible" string)
        title: String,
        /// Vendor-defined data following the title
        data: Vec<u8>,
    },
}

/// One firmware device ID record
///
/// Describes one class of device the package applies to, keyed by its
/// descriptors, and names the component images applicable to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareDeviceIdRecord {
    /// Device update option flags as stored in the package
    pub device_update_option_flags: u32,
    /// Indices into the component image table, decoded from the bitmap
    pub applicable_components: Vec<usize>,
    /// Component image set version string
    pub image_set_version: String,
    /// Descriptors keyed by descriptor type
    pub descriptors: BTreeMap<u16, Descriptor>,
    /// Opaque firmware device package data
    pub package_data: Vec<u8>,
}

/// One component image record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentImageInfo {
    /// Component classification code
    pub classification: u16,
    /// Component identifier
    pub identifier: u16,
    /// Component comparison stamp
    pub comparison_stamp: u32,
    /// Component options bitfield
    pub options: u16,
    /// Requested activation method bitfield
    pub requested_activation_method: u16,
    /// Offset of the image bytes from the start of the package
    pub location_offset: u32,
    /// Size of the image in bytes
    pub size: u32,
    /// Component version string
    pub version: String,
}

/// Parsed form of a PLDM Firmware Update package header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Package {
    /// Total header size in bytes, including the checksum
    pub header_size: u16,
    /// Header format revision
    pub header_revision: u8,
    /// Length of the applicable-components bitmap in bits
    pub component_bitmap_bit_length: u16,
    /// Package version string
    pub package_version: String,
    /// Stored header checksum
    pub package_checksum: u32,
    /// Firmware device ID records in package order
    pub fw_device_id_records: Vec<FirmwareDeviceIdRecord>,
    /// Component image records in package order
    pub component_images: Vec<ComponentImageInfo>,
}

// Bounds-checked little-endian reader over the package bytes. Every read
// names the field it is consuming so truncation errors stay diagnosable.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, len: usize, field: &'static str) -> ResultPackage<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(PackageError::Truncated(field))?;
        if end > self.data.len() {
            return Err(PackageError::Truncated(field));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> ResultPackage<u8> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> ResultPackage<u16> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self, field: &'static str) -> ResultPackage<u32> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self, len: usize, field: &'static str) -> ResultPackage<String> {
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PackageError::BadString(field))
    }
}

impl Package {
    /// Parse a memory-mapped package
    ///
    /// # Arguments
    /// * `data` - The complete package, header and image bytes
    ///
    /// # Returns
    /// The parsed header with every record area decoded
    ///
    /// # Errors
    /// A [`PackageError`] naming the first rejection: bad UUID or revision,
    /// truncation, bitmap or string problems, header checksum mismatch, or
    /// a component image region outside the package.
    pub fn parse(data: &[u8]) -> ResultPackage<Self> {
        if data.len() < MIN_HEADER_LEN {
            return Err(PackageError::Truncated("package header"));
        }

        let mut cursor = Cursor::new(data);

        let uuid = cursor.take(16, "header UUID")?;
        if uuid != PLDM_FWUP_V1_UUID {
            return Err(PackageError::UuidMismatch);
        }

        let header_revision = cursor.u8("header revision")?;
        if header_revision != PACKAGE_HEADER_REVISION {
            return Err(PackageError::UnsupportedRevision(header_revision));
        }

        let header_size = cursor.u16("header size")?;
        if usize::from(header_size) > data.len() || usize::from(header_size) < MIN_HEADER_LEN {
            return Err(PackageError::HeaderOutOfBounds {
                header_size: usize::from(header_size),
                available: data.len(),
            });
        }

        // Release timestamp is opaque to the update flow.
        cursor.take(13, "release timestamp")?;

        let component_bitmap_bit_length = cursor.u16("component bitmap bit length")?;
        if component_bitmap_bit_length == 0 || component_bitmap_bit_length % 8 != 0 {
            return Err(PackageError::BadBitmapLength(component_bitmap_bit_length));
        }

        let _version_type = cursor.u8("package version string type")?;
        let version_len = cursor.u8("package version string length")?;
        let package_version = cursor.string(usize::from(version_len), "package version string")?;

        trace!("package version {package_version:?}, bitmap length {component_bitmap_bit_length}");

        let record_count = cursor.u8("device ID record count")?;
        let mut fw_device_id_records = Vec::with_capacity(usize::from(record_count));
        for _ in 0..record_count {
            fw_device_id_records.push(parse_device_id_record(
                &mut cursor,
                component_bitmap_bit_length,
            )?);
        }

        let component_count = cursor.u16("component image count")?;
        let mut component_images = Vec::with_capacity(usize::from(component_count));
        for _ in 0..component_count {
            component_images.push(parse_component_image(&mut cursor)?);
        }

        let checksum_offset = usize::from(header_size) - 4;
        let stored = u32::from_le_bytes(
            data[checksum_offset..usize::from(header_size)]
                .try_into()
                .expect("checksum slice is 4 bytes"),
        );
        let computed = HEADER_CRC.checksum(&data[..checksum_offset]);
        if stored != computed {
            return Err(PackageError::ChecksumMismatch { stored, computed });
        }

        for (index, component) in component_images.iter().enumerate() {
            let end = u64::from(component.location_offset) + u64::from(component.size);
            if end > data.len() as u64 {
                return Err(PackageError::ComponentOutOfBounds { index });
            }
        }

        debug!(
            "parsed package {package_version:?}: {} device record(s), {} component image(s)",
            fw_device_id_records.len(),
            component_images.len()
        );

        Ok(Package {
            header_size,
            header_revision,
            component_bitmap_bit_length,
            package_version,
            package_checksum: stored,
            fw_device_id_records,
            component_images,
        })
    }
}

fn parse_device_id_record(
    cursor: &mut Cursor<'_>,
    component_bitmap_bit_length: u16,
) -> ResultPackage<FirmwareDeviceIdRecord> {
    let _record_length = cursor.u16("device record length")?;
    let descriptor_count = cursor.u8("descriptor count")?;
    let device_update_option_flags = cursor.u32("device update option flags")?;
    let _set_version_type = cursor.u8("image set version string type")?;
    let set_version_len = cursor.u8("image set version string length")?;
    let package_data_len = cursor.u16("device package data length")?;

    let bitmap = cursor.take(
        usize::from(component_bitmap_bit_length / 8),
        "applicable components bitmap",
    )?;
    let applicable_components = decode_bitmap(bitmap);

    let image_set_version = cursor.string(usize::from(set_version_len), "image set version string")?;

    let mut descriptors = BTreeMap::new();
    for _ in 0..descriptor_count {
        let descriptor_type = cursor.u16("descriptor type")?;
        let descriptor_len = cursor.u16("descriptor length")?;
        let payload = cursor.take(usize::from(descriptor_len), "descriptor data")?;

        let descriptor = if descriptor_type == DESCRIPTOR_VENDOR_DEFINED {
            parse_vendor_defined(payload)?
        } else {
            Descriptor::Raw(payload.to_vec())
        };
        descriptors.insert(descriptor_type, descriptor);
    }

    let package_data = cursor
        .take(usize::from(package_data_len), "device package data")?
        .to_vec();

    Ok(FirmwareDeviceIdRecord {
        device_update_option_flags,
        applicable_components,
        image_set_version,
        descriptors,
        package_data,
    })
}

// Vendor-defined descriptor payload: title string type, title length, title
// bytes, then free-form vendor data.
fn parse_vendor_defined(payload: &[u8]) -> ResultPackage<Descriptor> {
    if payload.len() < 2 {
        return Err(PackageError::BadVendorDescriptor);
    }
    let title_len = usize::from(payload[1]);
    let title_end = 2 + title_len;
    if payload.len() < title_end {
        return Err(PackageError::BadVendorDescriptor);
    }
    let title = String::from_utf8(payload[2..title_end].to_vec())
        .map_err(|_| PackageError::BadVendorDescriptor)?;
    Ok(Descriptor::VendorDefined {
        title,
        data: payload[title_end..].to_vec(),
    })
}

fn parse_component_image(cursor: &mut Cursor<'_>) -> ResultPackage<ComponentImageInfo> {
    let classification = cursor.u16("component classification")?;
    let identifier = cursor.u16("component identifier")?;
    let comparison_stamp = cursor.u32("component comparison stamp")?;
    let options = cursor.u16("component options")?;
    let requested_activation_method = cursor.u16("component activation method")?;
    let location_offset = cursor.u32("component location offset")?;
    let size = cursor.u32("component size")?;
    let _version_type = cursor.u8("component version string type")?;
    let version_len = cursor.u8("component version string length")?;
    let version = cursor.string(usize::from(version_len), "component version string")?;

    Ok(ComponentImageInfo {
        classification,
        identifier,
        comparison_stamp,
        options,
        requested_activation_method,
        location_offset,
        size,
        version,
    })
}

// Bit i set in the bitmap marks component index i as applicable, bits
// numbered LSB-first within each byte.
fn decode_bitmap(bitmap: &[u8]) -> Vec<usize> {
    let mut indices = Vec::new();
    for (byte_index, byte) in bitmap.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                indices.push(byte_index * 8 + bit);
            }
        }
    }
    indices
}
