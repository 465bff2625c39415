// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! Lattice JEDEC (JED) firmware file parser
//!
//! A JED file is a line-oriented ASCII description of the CPLD fuse map.
//! The parser extracts the pieces the programming engines need: the
//! configuration byte vector, the optional user-flash vector, the 32-bit
//! user code used as the running version, and the 16-bit file checksum.
//!
//! Significant tokens:
//! - `QF<n>*` fuse count
//! - `L0000` starts the configuration section; following lines of binary
//!   digits fold into bytes 8 bits at a time, MSB first
//! - an optional `NOTE EBR_INIT DATA` subsection parsed the same way
//! - after the configuration section ends, the same format feeds the UFM
//!   section
//! - `NOTE User Electronic` announces `UH<hex>*`, the user code
//! - `C<hex>*` the 16-bit checksum
//! - `NOTE DEVICE NAME:` names the chip the image was built for

use log::{debug, error};

// EBR initialization data is not programmed today; the subsection is
// recognized but folded in only when this is flipped on.
const ENABLE_UPDATE_EBR_INIT: bool = false;

const TAG_QF: &str = "QF";
const TAG_UH: &str = "UH";
const TAG_CF_START: &str = "L000";
const TAG_CHECKSUM: &str = "C";
const TAG_USER_CODE: &str = "NOTE User Electronic";
const TAG_EBR_INIT: &str = "NOTE EBR_INIT DATA";
const TAG_DEVICE_NAME: &str = "NOTE DEVICE NAME:";

/// JED parsing and verification error types
#[derive(thiserror::Error, Debug)]
pub enum JedError {
    /// The image is empty
    #[error("JED file is empty")]
    Empty,

    /// The `NOTE DEVICE NAME:` line does not name the configured chip
    #[error("JED file was built for a different chip than {expected}")]
    WrongChip {
        /// Chip model the device is configured as
        expected: String,
    },

    /// A tagged value line could not be parsed
    #[error("error in parsing {0} tag")]
    MalformedTag(&'static str),

    /// The stored checksum does not match the computed one (or is zero)
    #[error("JED file checksum error: stored {stored:#06X}, computed {computed:#06X}")]
    ChecksumMismatch {
        /// Checksum stored in the file
        stored: u16,
        /// Checksum computed over the data sections
        computed: u16,
    },
}

/// Parsed form of a JED firmware file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JedFile {
    /// Declared fuse count
    pub fuse_count: u64,
    /// Configuration section bytes in programming order
    pub cfg_data: Vec<u8>,
    /// User flash section bytes, possibly empty
    pub ufm_data: Vec<u8>,
    /// 32-bit user code programmed as the running version
    pub user_code: u32,
    /// 16-bit checksum stored in the file
    pub checksum: u16,
}

impl JedFile {
    /// Parse a JED image
    ///
    /// # Arguments
    /// * `image` - Raw file bytes
    /// * `chip_model` - When given, the `NOTE DEVICE NAME:` line must
    ///   contain this model string
    ///
    /// # Errors
    /// [`JedError::Empty`] for an empty image, [`JedError::WrongChip`]
    /// when the device-name note names another chip, or
    /// [`JedError::MalformedTag`] for unparsable tagged values.
    pub fn parse(image: &[u8], chip_model: Option<&str>) -> Result<Self, JedError> {
        if image.is_empty() {
            return Err(JedError::Empty);
        }

        let content = String::from_utf8_lossy(image);
        let mut jed = JedFile::default();

        let mut cfg_section = false;
        let mut ebr_section = false;
        let mut ufm_pending = false;
        let mut ufm_section = false;
        let mut expect_user_code = false;
        let mut expect_checksum = false;

        for line in content.lines() {
            let line = line.trim_end_matches('\r');

            if line.starts_with(TAG_QF) {
                let value = tag_value(line, TAG_QF).ok_or(JedError::MalformedTag("QF"))?;
                jed.fuse_count = value.parse().map_err(|_| JedError::MalformedTag("QF"))?;
                debug!("QF size = {}", jed.fuse_count);
            } else if line.starts_with(TAG_CF_START) {
                cfg_section = true;
            } else if ENABLE_UPDATE_EBR_INIT && line.starts_with(TAG_EBR_INIT) {
                ebr_section = true;
            } else if ufm_pending {
                ufm_pending = false;
                ufm_section = true;
                continue;
            } else if line.starts_with(TAG_USER_CODE) {
                expect_user_code = true;
            } else if line.starts_with(TAG_CHECKSUM) {
                expect_checksum = true;
            }

            if line.starts_with(TAG_DEVICE_NAME) {
                if let Some(chip) = chip_model {
                    if line.contains(chip) {
                        debug!("JED device name matches chip {chip}");
                    } else {
                        error!("JED device name line {line:?} does not match chip {chip}");
                        return Err(JedError::WrongChip {
                            expected: chip.to_owned(),
                        });
                    }
                }
            }

            if cfg_section {
                if !line.starts_with(TAG_CF_START) && line.len() != 1 {
                    if is_binary_line(line) {
                        fold_binary_line(line, &mut jed.cfg_data);
                    } else {
                        debug!("CF size = {}", jed.cfg_data.len());
                        cfg_section = false;
                        if !ebr_section {
                            ufm_pending = true;
                        }
                    }
                }
            } else if ebr_section {
                if !line.starts_with(TAG_EBR_INIT) && !line.starts_with('L') && line.len() != 1 {
                    if is_binary_line(line) {
                        fold_binary_line(line, &mut jed.cfg_data);
                    } else {
                        debug!("CF size with EBR_INIT data = {}", jed.cfg_data.len());
                        ebr_section = false;
                        ufm_pending = true;
                    }
                }
            } else if expect_checksum && line.len() != 1 {
                expect_checksum = false;
                let value = tag_value(line, TAG_CHECKSUM).ok_or(JedError::MalformedTag("C"))?;
                jed.checksum =
                    u16::from_str_radix(value, 16).map_err(|_| JedError::MalformedTag("C"))?;
                debug!("checksum = {:#06X}", jed.checksum);
            } else if expect_user_code {
                if !line.starts_with(TAG_USER_CODE) && line.len() != 1 {
                    expect_user_code = false;
                    if line.starts_with(TAG_UH) {
                        let value = tag_value(line, TAG_UH).ok_or(JedError::MalformedTag("UH"))?;
                        jed.user_code =
                            u32::from_str_radix(value, 16).map_err(|_| JedError::MalformedTag("UH"))?;
                        debug!("user code = {:#010X}", jed.user_code);
                    }
                }
            } else if ufm_section && !line.starts_with('L') && line.len() != 1 {
                if is_binary_line(line) {
                    fold_binary_line(line, &mut jed.ufm_data);
                } else {
                    debug!("UFM size = {}", jed.ufm_data.len());
                    ufm_section = false;
                }
            }
        }

        Ok(jed)
    }

    /// Verify the stored checksum against the data sections
    ///
    /// The file checksum is the 16-bit truncated sum of every data byte
    /// with its bits reversed, configuration section first. A stored
    /// checksum of zero never verifies.
    ///
    /// # Errors
    /// [`JedError::ChecksumMismatch`] with both values on failure.
    pub fn verify_checksum(&self) -> Result<(), JedError> {
        let sum: u32 = self
            .cfg_data
            .iter()
            .chain(self.ufm_data.iter())
            .map(|&byte| u32::from(reverse_bits(byte)))
            .sum();
        let computed = (sum & 0xFFFF) as u16;

        if self.checksum == 0 || self.checksum != computed {
            return Err(JedError::ChecksumMismatch {
                stored: self.checksum,
                computed,
            });
        }

        debug!("JED file checksum compare success");
        Ok(())
    }
}

fn reverse_bits(byte: u8) -> u8 {
    let byte = (byte & 0xF0) >> 4 | (byte & 0x0F) << 4;
    let byte = (byte & 0xCC) >> 2 | (byte & 0x33) << 2;
    (byte & 0xAA) >> 1 | (byte & 0x55) << 1
}

fn is_binary_line(line: &str) -> bool {
    line.starts_with('0') || line.starts_with('1')
}

// Fold a line of binary digits into bytes, 8 digits at a time MSB first.
// Parsing stops at the first group containing a non-binary character; a
// short trailing group folds low-aligned, matching the vendor tooling.
fn fold_binary_line(line: &str, out: &mut Vec<u8>) {
    for chunk in line.as_bytes().chunks(8) {
        let Ok(chunk) = std::str::from_utf8(chunk) else {
            break;
        };
        let valid_len = chunk
            .find(|c| c != '0' && c != '1')
            .unwrap_or(chunk.len());
        if valid_len == 0 {
            break;
        }
        if let Ok(value) = u8::from_str_radix(&chunk[..valid_len], 2) {
            out.push(value);
        }
        if valid_len < chunk.len() {
            break;
        }
    }
}

fn tag_value<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let rest = &line[tag.len()..];
    let end = rest.find('*')?;
    if end == 0 {
        return None;
    }
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::{JedError, JedFile, fold_binary_line, reverse_bits};

    const SAMPLE: &str = "\
NOTE DEVICE NAME: LCMXO3LF-4300C*\n\
QF16*\n\
L0000\n\
0000000011111111*\n\
\n\
\n\
L0016\n\
0000111100001111*\n\
\n\
NOTE User Electronic Signature Data*\n\
UH00000012*\n\
C02DF*\n";

    #[test]
    fn test_parse_sections() {
        let jed = JedFile::parse(SAMPLE.as_bytes(), Some("LCMXO3LF-4300C")).unwrap();
        assert_eq!(jed.fuse_count, 16);
        assert_eq!(jed.cfg_data, [0x00, 0xFF]);
        assert_eq!(jed.ufm_data, [0x0F, 0x0F]);
        assert_eq!(jed.user_code, 0x12);
        assert_eq!(jed.checksum, 0x02DF);
    }

    #[test]
    fn test_checksum_verifies() {
        let jed = JedFile::parse(SAMPLE.as_bytes(), None).unwrap();
        // reverse_bits(0x00) + reverse_bits(0xFF) + 2 * reverse_bits(0x0F)
        // = 0x00 + 0xFF + 2 * 0xF0 = 0x02DF, the stored value.
        jed.verify_checksum().unwrap();
    }

    #[test]
    fn test_checksum_of_cfg_only() {
        let jed = JedFile {
            cfg_data: vec![0x00, 0xFF],
            checksum: 0x00FF,
            ..JedFile::default()
        };
        jed.verify_checksum().unwrap();

        let wrong = JedFile {
            checksum: 0x00FE,
            ..jed
        };
        assert!(matches!(
            wrong.verify_checksum(),
            Err(JedError::ChecksumMismatch {
                stored: 0x00FE,
                computed: 0x00FF
            })
        ));
    }

    #[test]
    fn test_zero_checksum_always_rejected() {
        let jed = JedFile::default();
        assert!(jed.verify_checksum().is_err());
    }

    #[test]
    fn test_wrong_chip_rejected() {
        let result = JedFile::parse(SAMPLE.as_bytes(), Some("LCMXO3D-9400"));
        assert!(matches!(result, Err(JedError::WrongChip { .. })));
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(matches!(JedFile::parse(&[], None), Err(JedError::Empty)));
    }

    #[test]
    fn test_reverse_bits() {
        assert_eq!(reverse_bits(0x00), 0x00);
        assert_eq!(reverse_bits(0xFF), 0xFF);
        assert_eq!(reverse_bits(0x80), 0x01);
        assert_eq!(reverse_bits(0x0F), 0xF0);
        assert_eq!(reverse_bits(0xA5), 0xA5);
    }

    #[test]
    fn test_binary_line_folding_stops_at_terminator() {
        let mut out = Vec::new();
        fold_binary_line("0000000111111110*", &mut out);
        assert_eq!(out, [0x01, 0xFE]);
    }
}
