// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! Software objects and their observable state
//!
//! A [`Software`] instance stands for one installable firmware image on
//! one device, either the one currently running or a pending/in-flight
//! update. Its activation state, version, progress and associations are
//! the externally observable surface of an update: observers subscribe to
//! the watch channels instead of polling.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use rand::Rng;
use tokio::sync::watch;

/// Object path prefix for software objects
const SOFTWARE_PATH_BASE: &str = "/xyz/openbmc_project/software/";

/// When a programmed image takes effect
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, strum::Display, strum::EnumString)]
pub enum ApplyTime {
    /// The device switches to the new image inside the update call
    Immediate,
    /// The new image is latched and takes effect at the next reset
    OnReset,
}

/// Activation state machine of a software instance
///
/// `Invalid`, `Active` and `Failed` are terminal for one instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display)]
pub enum Activation {
    /// Created, nothing validated yet
    #[default]
    NotReady,
    /// The image does not apply to the device or failed validation
    Invalid,
    /// The image applies to the device and is ready to program
    Ready,
    /// Programming is in progress
    Activating,
    /// The image was programmed successfully
    Active,
    /// Programming failed
    Failed,
}

impl Activation {
    /// Whether this state admits no further transitions
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Invalid | Self::Active | Self::Failed)
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotReady, Self::Invalid | Self::Ready | Self::Failed)
                | (Self::Ready, Self::Activating)
                | (Self::Activating, Self::Active | Self::Failed)
        )
    }
}

/// Requested activation of a software instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display)]
pub enum RequestedActivation {
    /// No request pending
    #[default]
    None,
    /// Activation was requested
    Active,
}

/// Association triple published on a software object
pub type Association = (String, String, String);

/// Configuration validation error types
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The configuration name is empty
    #[error("invalid config 'Name' string: '{0}'")]
    InvalidName(String),

    /// The compatible string is not a dotted alphanumeric identifier
    #[error("invalid compatible string: '{0}'")]
    InvalidCompatible(String),

    /// A required configuration property is missing
    #[error("missing config property '{0}'")]
    MissingProperty(&'static str),

    /// The chip vendor has no programming support
    #[error("unknown chip vendor '{0}'")]
    UnknownVendor(String),

    /// The device bus could not be opened
    #[error("could not open the device bus")]
    Bus(#[from] crate::transport::TransportError),

    /// The programming engine could not be created for the configured chip
    #[error("could not create the programming engine")]
    Engine(#[from] crate::cpld::ProtocolError),
}

/// Immutable per-device software configuration from platform inventory
#[derive(Clone, Debug)]
pub struct SoftwareConfig {
    /// Inventory object path identifying the device
    pub object_path: String,
    /// IANA enterprise number of the firmware vendor
    pub vendor_iana: u32,
    /// Compatible hardware string matched against package descriptors
    pub compatible_hardware: String,
    /// Configuration type, e.g. `CPLDFirmware`
    pub config_type: String,
    /// Configuration name, used as the software id prefix
    pub config_name: String,
}

impl SoftwareConfig {
    /// Validate and construct a device configuration
    ///
    /// # Errors
    /// [`ConfigError::InvalidName`] for an empty name and
    /// [`ConfigError::InvalidCompatible`] when the compatible string is
    /// not of the `com.vendor.Board.Device` dotted form.
    pub fn new(
        object_path: &str,
        vendor_iana: u32,
        compatible_hardware: &str,
        config_type: &str,
        config_name: &str,
    ) -> Result<Self, ConfigError> {
        if config_name.is_empty() {
            return Err(ConfigError::InvalidName(config_name.to_owned()));
        }

        if !compatible_valid(compatible_hardware) {
            return Err(ConfigError::InvalidCompatible(compatible_hardware.to_owned()));
        }

        Ok(SoftwareConfig {
            object_path: object_path.to_owned(),
            vendor_iana,
            compatible_hardware: compatible_hardware.to_owned(),
            config_type: config_type.to_owned(),
            config_name: config_name.to_owned(),
        })
    }
}

// At least two dot-separated segments, each non-empty alphanumeric ASCII.
fn compatible_valid(compatible: &str) -> bool {
    let mut segments = 0;
    for segment in compatible.split('.') {
        if segment.is_empty() || !segment.bytes().all(|byte| byte.is_ascii_alphanumeric()) {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

#[derive(Debug, Default)]
struct SoftwareInner {
    version: Option<String>,
    requested_activation: RequestedActivation,
    blocks_transition: bool,
    associations: BTreeSet<Association>,
    update_apply_times: Option<BTreeSet<ApplyTime>>,
}

/// One installable software image instance
///
/// Created by the device orchestrator for the running image and for every
/// update request; dropped when superseded or failed. All state is
/// interior-mutable so the instance can be shared with observers.
#[derive(Debug)]
pub struct Software {
    swid: String,
    object_path: String,
    activation: watch::Sender<Activation>,
    progress: watch::Sender<Option<u8>>,
    inner: Mutex<SoftwareInner>,
}

impl Software {
    /// Create a software instance with a fresh random id
    ///
    /// The id is `<configName>_<4 random digits>`; only the prefix is
    /// meaningful.
    #[must_use]
    pub fn new(config_name: &str) -> Arc<Self> {
        let suffix: u16 = rand::thread_rng().gen_range(0..10000);
        let swid = format!("{config_name}_{suffix:04}");
        let object_path = format!("{SOFTWARE_PATH_BASE}{swid}");

        debug!("{swid}: created software object at {object_path}");

        Arc::new(Software {
            swid,
            object_path,
            activation: watch::Sender::new(Activation::NotReady),
            progress: watch::Sender::new(None),
            inner: Mutex::new(SoftwareInner::default()),
        })
    }

    /// Create the software instance standing for an already-running image
    ///
    /// Starts in the `Active` state; used by devices when they publish the
    /// image found on the hardware at enumeration time.
    #[must_use]
    pub fn new_running(config_name: &str) -> Arc<Self> {
        let suffix: u16 = rand::thread_rng().gen_range(0..10000);
        let swid = format!("{config_name}_{suffix:04}");
        let object_path = format!("{SOFTWARE_PATH_BASE}{swid}");

        debug!("{swid}: created running software object at {object_path}");

        Arc::new(Software {
            swid,
            object_path,
            activation: watch::Sender::new(Activation::Active),
            progress: watch::Sender::new(None),
            inner: Mutex::new(SoftwareInner::default()),
        })
    }

    /// Software identifier
    #[must_use]
    pub fn swid(&self) -> &str {
        &self.swid
    }

    /// Object path of this software instance
    #[must_use]
    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    /// Current activation state
    #[must_use]
    pub fn activation(&self) -> Activation {
        *self.activation.borrow()
    }

    /// Subscribe to activation state changes
    #[must_use]
    pub fn subscribe_activation(&self) -> watch::Receiver<Activation> {
        self.activation.subscribe()
    }

    /// Advance the activation state machine
    ///
    /// Illegal transitions, including any transition out of a terminal
    /// state, are logged and ignored.
    pub fn set_activation(&self, next: Activation) {
        let current = *self.activation.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            error!("{}: illegal activation transition {current} -> {next}", self.swid);
            return;
        }

        debug!("{}: activation {current} -> {next}", self.swid);
        self.activation.send_replace(next);
    }

    /// Version string; `None` until published
    #[must_use]
    pub fn version(&self) -> Option<String> {
        self.inner.lock().expect("software lock poisoned").version.clone()
    }

    /// Publish the version string; it can only be set once
    pub fn set_version(&self, version: &str) {
        let mut inner = self.inner.lock().expect("software lock poisoned");
        if inner.version.is_some() {
            error!("{}: version was already set", self.swid);
            return;
        }
        debug!("{}: set version {version}", self.swid);
        inner.version = Some(version.to_owned());
    }

    /// Current progress; `None` while no update is activating
    #[must_use]
    pub fn progress(&self) -> Option<u8> {
        *self.progress.borrow()
    }

    /// Subscribe to progress changes
    #[must_use]
    pub fn subscribe_progress(&self) -> watch::Receiver<Option<u8>> {
        self.progress.subscribe()
    }

    /// Create the progress object at zero
    pub fn create_progress(&self) {
        self.progress.send_replace(Some(0));
    }

    /// Advance progress; values never decrease and cap at 100
    pub fn set_progress(&self, value: u8) {
        let value = value.min(100);
        let current = *self.progress.borrow();
        match current {
            None => warn!("{}: progress set while not activating", self.swid),
            Some(current) if value < current => {
                warn!("{}: ignoring progress regression {current} -> {value}", self.swid);
            }
            Some(_) => {
                self.progress.send_replace(Some(value));
            }
        }
    }

    /// Remove the progress object
    pub fn clear_progress(&self) {
        self.progress.send_replace(None);
    }

    /// Whether host power transitions are blocked by this software
    #[must_use]
    pub fn blocks_transition(&self) -> bool {
        self.inner.lock().expect("software lock poisoned").blocks_transition
    }

    /// Publish or retract the blocks-transition marker
    pub fn set_blocks_transition(&self, enabled: bool) {
        self.inner.lock().expect("software lock poisoned").blocks_transition = enabled;
    }

    /// Requested activation
    #[must_use]
    pub fn requested_activation(&self) -> RequestedActivation {
        self.inner
            .lock()
            .expect("software lock poisoned")
            .requested_activation
    }

    /// Record a requested activation
    pub fn set_requested_activation(&self, requested: RequestedActivation) {
        self.inner
            .lock()
            .expect("software lock poisoned")
            .requested_activation = requested;
    }

    /// Published association triples
    #[must_use]
    pub fn associations(&self) -> BTreeSet<Association> {
        self.inner
            .lock()
            .expect("software lock poisoned")
            .associations
            .clone()
    }

    /// Publish the running/activating associations against an inventory
    /// endpoint, replacing any previous set
    pub fn set_associations(&self, running: bool, activating: bool, endpoint: &str) {
        let mut associations = BTreeSet::new();
        if running {
            debug!("{}: creating 'running' association to {endpoint}", self.swid);
            associations.insert(("running".to_owned(), "ran_on".to_owned(), endpoint.to_owned()));
        }
        if activating {
            debug!("{}: creating 'activating' association to {endpoint}", self.swid);
            associations.insert((
                "activating".to_owned(),
                "activated_on".to_owned(),
                endpoint.to_owned(),
            ));
        }
        self.inner.lock().expect("software lock poisoned").associations = associations;
    }

    /// Whether this software accepts replacement updates
    #[must_use]
    pub fn update_enabled(&self) -> bool {
        self.inner
            .lock()
            .expect("software lock poisoned")
            .update_apply_times
            .is_some()
    }

    /// Apply times accepted for replacement updates
    #[must_use]
    pub fn allowed_apply_times(&self) -> Option<BTreeSet<ApplyTime>> {
        self.inner
            .lock()
            .expect("software lock poisoned")
            .update_apply_times
            .clone()
    }

    /// Enable replacement updates with the device's allowed apply times
    pub fn enable_update(&self, allowed_apply_times: &BTreeSet<ApplyTime>) {
        let mut inner = self.inner.lock().expect("software lock poisoned");
        if inner.update_apply_times.is_some() {
            error!("{}: update was already enabled", self.swid);
            return;
        }
        debug!("{}: enabling update", self.swid);
        inner.update_apply_times = Some(allowed_apply_times.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{Activation, ApplyTime, ConfigError, Software, SoftwareConfig};

    #[test]
    fn test_swid_prefix_and_path() {
        let software = Software::new("MainBoardCPLD");
        assert!(software.swid().starts_with("MainBoardCPLD_"));
        assert_eq!(
            software.object_path(),
            format!("/xyz/openbmc_project/software/{}", software.swid())
        );
    }

    #[test]
    fn test_activation_happy_path() {
        let software = Software::new("dev");
        assert_eq!(software.activation(), Activation::NotReady);

        software.set_activation(Activation::Ready);
        software.set_activation(Activation::Activating);
        software.set_activation(Activation::Active);
        assert_eq!(software.activation(), Activation::Active);
    }

    #[test]
    fn test_no_transition_out_of_terminal_state() {
        let software = Software::new("dev");
        software.set_activation(Activation::Invalid);
        assert_eq!(software.activation(), Activation::Invalid);

        software.set_activation(Activation::Ready);
        software.set_activation(Activation::Active);
        assert_eq!(software.activation(), Activation::Invalid);
    }

    #[test]
    fn test_illegal_transition_ignored() {
        let software = Software::new("dev");
        software.set_activation(Activation::Active);
        assert_eq!(software.activation(), Activation::NotReady);
    }

    #[test]
    fn test_version_set_once() {
        let software = Software::new("dev");
        software.set_version("1.2");
        software.set_version("9.9");
        assert_eq!(software.version().as_deref(), Some("1.2"));
    }

    #[test]
    fn test_progress_monotonic() {
        let software = Software::new("dev");
        assert_eq!(software.progress(), None);

        software.create_progress();
        software.set_progress(40);
        software.set_progress(20);
        assert_eq!(software.progress(), Some(40));

        software.set_progress(100);
        assert_eq!(software.progress(), Some(100));

        software.clear_progress();
        assert_eq!(software.progress(), None);
    }

    #[test]
    fn test_enable_update_once() {
        let software = Software::new("dev");
        assert!(!software.update_enabled());

        let times: BTreeSet<ApplyTime> = [ApplyTime::Immediate].into();
        software.enable_update(&times);
        assert_eq!(software.allowed_apply_times(), Some(times.clone()));

        let both: BTreeSet<ApplyTime> = [ApplyTime::Immediate, ApplyTime::OnReset].into();
        software.enable_update(&both);
        assert_eq!(software.allowed_apply_times(), Some(times));
    }

    #[test]
    fn test_associations_replace() {
        let software = Software::new("dev");
        software.set_associations(false, true, "/inventory/board");
        let activating = software.associations();
        assert_eq!(activating.len(), 1);
        assert!(activating.iter().any(|(forward, _, _)| forward == "activating"));

        software.set_associations(true, false, "/inventory/board");
        let running = software.associations();
        assert_eq!(running.len(), 1);
        assert!(running.iter().any(|(forward, _, _)| forward == "running"));
    }

    #[test]
    fn test_config_validation() {
        assert!(SoftwareConfig::new("/path", 0xA015, "com.example.Board.CPLD", "CPLDFirmware", "x").is_ok());

        assert!(matches!(
            SoftwareConfig::new("/path", 0, "com.example.Board", "CPLDFirmware", ""),
            Err(ConfigError::InvalidName(_))
        ));
        assert!(matches!(
            SoftwareConfig::new("/path", 0, "singlesegment", "CPLDFirmware", "x"),
            Err(ConfigError::InvalidCompatible(_))
        ));
        assert!(matches!(
            SoftwareConfig::new("/path", 0, "com..Board", "CPLDFirmware", "x"),
            Err(ConfigError::InvalidCompatible(_))
        ));
        assert!(matches!(
            SoftwareConfig::new("/path", 0, "com.exam ple.Board", "CPLDFirmware", "x"),
            Err(ConfigError::InvalidCompatible(_))
        ));
    }
}
