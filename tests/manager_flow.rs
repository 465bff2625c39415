// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! Manager-level enumeration and update request routing.

mod common;

use common::{SimBus, cpld_record, package_file, package_with_jed};
use swupd::manager::{PropertyValue, RequestError, SoftwareManager};
use swupd::software::{Activation, ApplyTime};

const BOARD_PATH: &str = "/xyz/openbmc_project/inventory/system/board/test/CPLD";

fn sim_manager(bus: SimBus) -> SoftwareManager<SimBus> {
    SoftwareManager::with_transport(
        "CPLDSoftwareManager",
        Box::new(move |_bus, _address| Ok(bus.clone())),
    )
}

#[tokio::test(start_paused = true)]
async fn test_enumeration_skips_bad_records() {
    let bus = SimBus::new();
    bus.state().user_code = 0xCAFE_0001;
    let mut manager = sim_manager(bus);

    let valid = cpld_record(BOARD_PATH, "MainBoardCPLD");

    let mut missing_bus = cpld_record("/inventory/missing-bus", "NoBusCPLD");
    missing_bus.properties.remove("Bus");

    let mut bad_compatible = cpld_record("/inventory/bad-compatible", "BadCompatCPLD");
    bad_compatible.properties.insert(
        "Compatible".to_owned(),
        PropertyValue::String("not a compatible".to_owned()),
    );

    let mut unknown_chip = cpld_record("/inventory/unknown-chip", "UnknownChipCPLD");
    unknown_chip.properties.insert(
        "ChipFamily".to_owned(),
        PropertyValue::String("LCMXO9-1".to_owned()),
    );

    let mut other_interface = cpld_record("/inventory/other", "OtherConfig");
    other_interface.interface = "xyz.openbmc_project.Configuration.BIOSFirmware".to_owned();

    manager
        .init_devices(&[valid, missing_bus, bad_compatible, unknown_chip, other_interface])
        .await;

    assert_eq!(manager.device_count(), 1);
    assert!(manager.device(BOARD_PATH).is_some());
    assert!(manager.device("/inventory/missing-bus").is_none());
    assert_eq!(
        manager.service_name(),
        "xyz.openbmc_project.Software.CPLDSoftwareManager"
    );
}

#[tokio::test(start_paused = true)]
async fn test_enumeration_publishes_running_version() {
    let bus = SimBus::new();
    bus.state().user_code = 0xCAFE_0001;
    let mut manager = sim_manager(bus);

    manager.init_devices(&[cpld_record(BOARD_PATH, "MainBoardCPLD")]).await;

    let device = manager.device(BOARD_PATH).unwrap();
    let current = device.software_current().unwrap();
    assert_eq!(current.activation(), Activation::Active);
    assert_eq!(current.version().as_deref(), Some("cafe0001"));
    assert!(current.swid().starts_with("MainBoardCPLD_"));
    assert!(current.update_enabled());
}

#[tokio::test(start_paused = true)]
async fn test_update_request_routing() {
    let bus = SimBus::new();
    let mut manager = sim_manager(bus.clone());
    manager.init_devices(&[cpld_record(BOARD_PATH, "MainBoardCPLD")]).await;

    let cfg: Vec<u8> = (0u8..16).collect();
    let package = package_file(&package_with_jed(&cfg, "c1"), "routed");

    let unknown = manager.start_update("/inventory/nonexistent", &package, ApplyTime::Immediate);
    assert!(matches!(unknown, Err(RequestError::UnknownDevice(_))));

    let path = manager
        .start_update(BOARD_PATH, &package, ApplyTime::Immediate)
        .unwrap();
    assert!(path.starts_with("/xyz/openbmc_project/software/MainBoardCPLD_"));

    manager.wait_for_updates().await;

    let device = manager.device(BOARD_PATH).unwrap();
    let current = device.software_current().unwrap();
    assert_eq!(current.activation(), Activation::Active);
    assert_eq!(current.version().as_deref(), Some("c1"));
    assert_eq!(bus.state().pages[&0], cfg);
}
