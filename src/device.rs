// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! Per-device update orchestrator
//!
//! A [`Device`] owns one updatable piece of hardware: its configuration,
//! its current (and possibly pending) software object, and the protocol
//! engine that can program it. `start_update` admits at most one update at
//! a time, returns the new software's object path immediately and runs the
//! package→device pipeline as a background task; every outcome after
//! admission is surfaced through the new software's activation state, never
//! as an error to the caller.

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use tokio::task::JoinHandle;

use crate::cpld::CpldEngine;
use crate::host_power::{HostPower, HostState, set_state_observed};
use crate::pldm::{Package, match_component};
use crate::software::{
    Activation, ApplyTime, RequestedActivation, Software, SoftwareConfig,
};
use crate::transport::ByteTransport;

/// Update admission error types
///
/// These are the only errors a caller of `start_update` ever sees; once a
/// request is admitted, failures show up as the new software's activation
/// state.
#[derive(thiserror::Error, Debug)]
pub enum StartUpdateError {
    /// The device already has an update in flight
    #[error("an update is already in progress")]
    UpdateInProgress,

    /// The requested apply time is not allowed by this device
    #[error("apply time {0} is not allowed by the device")]
    ApplyTimeNotAllowed(ApplyTime),

    /// The image descriptor could not be duplicated
    #[error("could not duplicate the image descriptor")]
    ImageDup(#[from] io::Error),
}

// Read-only mapping of the package file, unmapped when the update task
// finishes with it.
#[derive(Debug)]
struct MappedImage {
    addr: *mut libc::c_void,
    len: usize,
}

// The mapping is immutable shared memory; moving it between tasks is fine.
unsafe impl Send for MappedImage {}

impl MappedImage {
    fn new(image: &File) -> io::Result<Self> {
        let len = image.metadata()?.len() as usize;
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty image"));
        }

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                image.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(MappedImage { addr, len })
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr.cast_const().cast::<u8>(), self.len) }
    }
}

impl Drop for MappedImage {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.addr, self.len) };
        if result != 0 {
            error!("failed to unmap the update package");
        }
    }
}

#[derive(Debug, Default)]
struct DeviceSoftware {
    current: Option<Arc<Software>>,
    pending: Option<Arc<Software>>,
    in_flight: Option<Arc<Software>>,
}

#[derive(Debug, Default)]
struct DeviceShared {
    update_in_progress: AtomicBool,
    software: Mutex<DeviceSoftware>,
}

/// One updatable device and its update orchestration state
pub struct Device<T: ByteTransport + Send + 'static> {
    config: SoftwareConfig,
    allowed_apply_times: BTreeSet<ApplyTime>,
    engine: Arc<tokio::sync::Mutex<CpldEngine<T>>>,
    host_power: Option<Arc<dyn HostPower>>,
    shared: Arc<DeviceShared>,
    task: Mutex<Option<JoinHandle<bool>>>,
}

impl<T: ByteTransport + Send + 'static> Device<T> {
    /// Construct a device around its engine
    #[must_use]
    pub fn new(
        config: SoftwareConfig,
        allowed_apply_times: BTreeSet<ApplyTime>,
        engine: CpldEngine<T>,
        host_power: Option<Arc<dyn HostPower>>,
    ) -> Self {
        Device {
            config,
            allowed_apply_times,
            engine: Arc::new(tokio::sync::Mutex::new(engine)),
            host_power,
            shared: Arc::new(DeviceShared::default()),
            task: Mutex::new(None),
        }
    }

    /// Device configuration
    #[must_use]
    pub fn config(&self) -> &SoftwareConfig {
        &self.config
    }

    /// Apply times this device accepts
    #[must_use]
    pub fn allowed_apply_times(&self) -> &BTreeSet<ApplyTime> {
        &self.allowed_apply_times
    }

    /// Protocol engine handle
    #[must_use]
    pub fn engine(&self) -> Arc<tokio::sync::Mutex<CpldEngine<T>>> {
        Arc::clone(&self.engine)
    }

    /// Publish the currently running software with the given version
    pub fn initialize_current(&self, version: &str) {
        let software = Software::new_running(&self.config.config_name);
        software.set_version(version);
        software.set_associations(true, false, &self.config.object_path);
        software.enable_update(&self.allowed_apply_times);

        info!(
            "{}: running software {} version {version}",
            self.config.config_name,
            software.swid()
        );

        self.shared
            .software
            .lock()
            .expect("device lock poisoned")
            .current = Some(software);
    }

    /// Currently running software object
    #[must_use]
    pub fn software_current(&self) -> Option<Arc<Software>> {
        self.shared
            .software
            .lock()
            .expect("device lock poisoned")
            .current
            .clone()
    }

    /// Software pending activation at the next reset
    #[must_use]
    pub fn pending_software(&self) -> Option<Arc<Software>> {
        self.shared
            .software
            .lock()
            .expect("device lock poisoned")
            .pending
            .clone()
    }

    /// Software of the in-flight update, if one is running
    #[must_use]
    pub fn in_flight_software(&self) -> Option<Arc<Software>> {
        self.shared
            .software
            .lock()
            .expect("device lock poisoned")
            .in_flight
            .clone()
    }

    /// Start an update from a package image
    ///
    /// The image descriptor is duplicated, so the caller may close its
    /// copy. On admission the new software's object path returns
    /// immediately and the update continues as a background task.
    ///
    /// # Errors
    /// [`StartUpdateError::ApplyTimeNotAllowed`] or
    /// [`StartUpdateError::UpdateInProgress`]; both leave all device state
    /// untouched.
    pub fn start_update(
        &self,
        image: &File,
        apply_time: ApplyTime,
    ) -> Result<String, StartUpdateError> {
        if !self.allowed_apply_times.contains(&apply_time) {
            error!(
                "{}: apply time {apply_time} is not allowed",
                self.config.config_name
            );
            return Err(StartUpdateError::ApplyTimeNotAllowed(apply_time));
        }

        if self
            .shared
            .update_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!(
                "{}: an update is already in progress",
                self.config.config_name
            );
            return Err(StartUpdateError::UpdateInProgress);
        }

        let image = match image.try_clone() {
            Ok(image) => image,
            Err(err) => {
                self.shared.update_in_progress.store(false, Ordering::Release);
                return Err(err.into());
            }
        };

        let software = Software::new(&self.config.config_name);
        let object_path = software.object_path().to_owned();
        self.shared
            .software
            .lock()
            .expect("device lock poisoned")
            .in_flight = Some(Arc::clone(&software));

        info!(
            "{}: starting asynchronous {apply_time} update as {}",
            self.config.config_name,
            software.swid()
        );

        let task = tokio::task::spawn(Self::run_update(
            Arc::clone(&self.shared),
            Arc::clone(&self.engine),
            self.config.clone(),
            self.allowed_apply_times.clone(),
            self.host_power.clone(),
            image,
            apply_time,
            software,
        ));
        *self.task.lock().expect("device lock poisoned") = Some(task);

        Ok(object_path)
    }

    /// Wait for the in-flight update task, if any, to finish
    ///
    /// Returns the task's success flag; `true` when no task was running.
    pub async fn wait_for_update(&self) -> bool {
        let task = self.task.lock().expect("device lock poisoned").take();
        match task {
            Some(task) => task.await.unwrap_or(false),
            None => true,
        }
    }

    #[expect(clippy::too_many_arguments, reason = "task entry point owning its context")]
    async fn run_update(
        shared: Arc<DeviceShared>,
        engine: Arc<tokio::sync::Mutex<CpldEngine<T>>>,
        config: SoftwareConfig,
        allowed_apply_times: BTreeSet<ApplyTime>,
        host_power: Option<Arc<dyn HostPower>>,
        image: File,
        apply_time: ApplyTime,
        software: Arc<Software>,
    ) -> bool {
        let success = Self::run_update_pipeline(
            &engine,
            &config,
            host_power.as_deref(),
            &image,
            apply_time,
            &software,
        )
        .await;

        {
            let mut state = shared.software.lock().expect("device lock poisoned");
            state.in_flight = None;

            if success {
                match apply_time {
                    ApplyTime::Immediate => {
                        if let Some(old) = &state.current {
                            info!("deleting old software version {}", old.swid());
                        }
                        software.set_associations(true, false, &config.object_path);
                        software.enable_update(&allowed_apply_times);
                        state.current = Some(Arc::clone(&software));
                        // An immediate update supersedes anything still
                        // waiting for a reset.
                        state.pending = None;
                        info!("new current software version: {}", software.swid());
                    }
                    ApplyTime::OnReset => {
                        software.set_associations(false, true, &config.object_path);
                        software.set_requested_activation(RequestedActivation::Active);
                        state.pending = Some(Arc::clone(&software));
                        info!("software {} pending until the next reset", software.swid());
                    }
                }
            } else {
                info!("update failed, dropping software version {}", software.swid());
            }
        }

        shared.update_in_progress.store(false, Ordering::Release);
        success
    }

    // The package→device pipeline: map, parse, match, program. Every
    // failure lands in a terminal activation state of `software`.
    async fn run_update_pipeline(
        engine: &tokio::sync::Mutex<CpldEngine<T>>,
        config: &SoftwareConfig,
        host_power: Option<&dyn HostPower>,
        image: &File,
        apply_time: ApplyTime,
        software: &Arc<Software>,
    ) -> bool {
        let mapped = match MappedImage::new(image) {
            Ok(mapped) => mapped,
            Err(err) => {
                error!("could not map the update package: {err}");
                software.set_activation(Activation::Failed);
                return false;
            }
        };
        debug!("mapped the update package ({} bytes)", mapped.bytes().len());

        let package = match Package::parse(mapped.bytes()) {
            Ok(package) => package,
            Err(err) => {
                error!("could not parse the update package: {err}");
                software.set_activation(Activation::Invalid);
                return false;
            }
        };

        let (offset, size, version) = match match_component(
            &package,
            config.vendor_iana,
            &config.compatible_hardware,
        ) {
            Ok(matched) => (matched.offset, matched.size, matched.version.to_owned()),
            Err(err) => {
                error!("no component image for this device: {err}");
                software.set_activation(Activation::Invalid);
                return false;
            }
        };

        software.set_activation(Activation::Ready);
        software.set_version(&version);
        software.create_progress();
        software.set_blocks_transition(true);
        software.set_activation(Activation::Activating);

        let component = &mapped.bytes()[offset..offset + size];
        let success = {
            let mut engine = engine.lock().await;
            software.set_progress(1);

            let progress_software = Arc::clone(software);
            let mut report = move |value: u8| progress_software.set_progress(value);

            match engine.update_firmware(component, &mut report).await {
                Ok(()) => {
                    software.set_progress(100);
                    true
                }
                Err(err) => {
                    error!("failed to update the device: {err}");
                    false
                }
            }
        };

        if success {
            software.set_activation(Activation::Active);
        }
        software.set_blocks_transition(false);
        software.clear_progress();

        if !success {
            software.set_activation(Activation::Failed);
            return false;
        }

        if apply_time == ApplyTime::Immediate {
            Self::reset_device(host_power).await;
        }

        true
    }

    // Power-cycle the host so the device latches the new image. Without a
    // power handle the new image takes effect at the next platform reset.
    async fn reset_device(host_power: Option<&dyn HostPower>) {
        let Some(power) = host_power else {
            info!("no host power handle, device reset deferred to the platform");
            return;
        };

        if let Err(err) = set_state_observed(power, HostState::Off).await {
            error!("host power-off for device reset failed: {err}");
            return;
        }
        if let Err(err) = set_state_observed(power, HostState::On).await {
            error!("host power-on after device reset failed: {err}");
        }
    }
}
