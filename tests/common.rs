// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! Shared fixtures for the integration suites: a PLDM package around a JED
//! component image, a scripted XO3 flash transport and inventory records.
#![allow(dead_code, reason = "not every suite uses every helper")]

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::sync::{Arc, Mutex};

use swupd::manager::{InventoryRecord, PropertyValue};
use swupd::pldm::builder::PackageBuilder;
use swupd::transport::{ByteTransport, ResultTransport};

/// Vendor IANA used by the test board
pub const TEST_IANA: u32 = 0x03020100;
/// Compatible string used by the test board
pub const TEST_COMPATIBLE: &str = "com.example.Board";

/// Render a Lattice XO3 JED file for the given configuration bytes
pub fn make_xo3_jed(cfg: &[u8], user_code: u32) -> String {
    let mut text = String::from("NOTE DEVICE NAME: LCMXO3LF-4300C*\n");
    text.push_str(&format!("QF{}*\n", cfg.len() * 8));
    text.push_str("L0000\n");
    for chunk in cfg.chunks(2) {
        for byte in chunk {
            text.push_str(&format!("{byte:08b}"));
        }
        text.push('\n');
    }
    let checksum: u32 = cfg.iter().map(|&b| u32::from(b.reverse_bits())).sum();
    text.push('\n');
    text.push('\n');
    text.push_str("NOTE User Electronic Signature Data*\n");
    text.push_str(&format!("UH{user_code:08X}*\n"));
    text.push_str(&format!("C{:04X}*\n", checksum & 0xFFFF));
    text
}

/// Build a package whose only component is a JED image for the test board
pub fn package_with_jed(cfg: &[u8], component_version: &str) -> Vec<u8> {
    let jed = make_xo3_jed(cfg, 0x0000_0042);
    PackageBuilder::new("v1")
        .device_record(TEST_IANA, TEST_COMPATIBLE, &[0])
        .component(component_version, jed.as_bytes())
        .build()
}

/// Write package bytes to an anonymous temp file
///
/// The path is unlinked right away; the returned descriptor keeps the
/// contents alive for the update to map.
pub fn package_file(bytes: &[u8], tag: &str) -> File {
    let path = std::env::temp_dir().join(format!(
        "cpldupd-test-{}-{tag}.bin",
        std::process::id()
    ));
    fs::write(&path, bytes).unwrap();
    let file = File::open(&path).unwrap();
    fs::remove_file(&path).unwrap();
    file
}

/// State behind a [`SimBus`]
#[derive(Debug, Default)]
pub struct SimState {
    /// Every write that reached the device, in order
    pub writes: Vec<Vec<u8>>,
    /// Flash pages keyed by page index
    pub pages: HashMap<u16, Vec<u8>>,
    /// Programmed user code
    pub user_code: u32,
    /// Status register byte handed back on 0x3C reads
    pub status_byte: u8,
    page_address: u16,
}

impl SimState {
    /// Opcode of every write, in order
    pub fn opcodes(&self) -> Vec<u8> {
        self.writes.iter().map(|write| write[0]).collect()
    }

    /// Opcodes with the busy/status polling filtered out
    pub fn main_opcodes(&self) -> Vec<u8> {
        self.opcodes()
            .into_iter()
            .filter(|op| *op != 0xF0 && *op != 0x3C)
            .collect()
    }
}

/// Scripted LCMXO3LF-4300C flash device shared between the engine under
/// test and the assertions
#[derive(Clone, Debug)]
pub struct SimBus(pub Arc<Mutex<SimState>>);

impl SimBus {
    pub fn new() -> Self {
        SimBus(Arc::new(Mutex::new(SimState::default())))
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.0.lock().unwrap()
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteTransport for SimBus {
    fn send_receive(&mut self, write: &[u8], read_len: usize) -> ResultTransport<Vec<u8>> {
        let mut state = self.0.lock().unwrap();
        state.writes.push(write.to_vec());
        let opcode = write.first().copied().unwrap_or(0);

        Ok(match opcode {
            // LCMXO3LF-4300C device id
            0xE0 => vec![0x61, 0x2B, 0xC0, 0x43],
            0xF0 => vec![0x00],
            0x3C => vec![0, 0, state.status_byte, 0],
            0xB4 => {
                state.page_address = u16::from_be_bytes([write[6], write[7]]);
                Vec::new()
            }
            0x70 => {
                let page_address = state.page_address;
                state.pages.insert(page_address, write[4..].to_vec());
                Vec::new()
            }
            0x73 => {
                let page_address = state.page_address;
                state
                    .pages
                    .get(&page_address)
                    .cloned()
                    .unwrap_or_else(|| vec![0xFF; read_len])
            }
            0xC2 => {
                state.user_code = u32::from_be_bytes(write[4..8].try_into().unwrap());
                Vec::new()
            }
            0xC0 => state.user_code.to_be_bytes().to_vec(),
            _ => vec![0; read_len],
        })
    }

    fn identifier(&self) -> &str {
        "sim-bus"
    }
}

/// Inventory record for one CPLD device with the standard property set
pub fn cpld_record(object_path: &str, name: &str) -> InventoryRecord {
    let mut properties = BTreeMap::new();
    properties.insert("Name".to_owned(), PropertyValue::String(name.to_owned()));
    properties.insert(
        "Type".to_owned(),
        PropertyValue::String("CPLDFirmware".to_owned()),
    );
    properties.insert("VendorIANA".to_owned(), PropertyValue::U64(u64::from(TEST_IANA)));
    properties.insert(
        "Compatible".to_owned(),
        PropertyValue::String(TEST_COMPATIBLE.to_owned()),
    );
    properties.insert("Bus".to_owned(), PropertyValue::U64(3));
    properties.insert("Address".to_owned(), PropertyValue::U64(0x40));
    properties.insert(
        "ChipVendor".to_owned(),
        PropertyValue::String("lattice".to_owned()),
    );
    properties.insert(
        "ChipFamily".to_owned(),
        PropertyValue::String("LCMXO3LF-4300C".to_owned()),
    );

    InventoryRecord {
        object_path: object_path.to_owned(),
        interface: "xyz.openbmc_project.Configuration.CPLDFirmware".to_owned(),
        properties,
    }
}
