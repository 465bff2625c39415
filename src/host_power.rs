// Copyright 2025 NXP
//
// SPDX-License-Identifier: BSD-3-Clause
//! Host power state observation
//!
//! The update orchestrator never owns the host power resource; it requests
//! a transition from the platform power service and then observes the
//! state until it matches or a timeout elapses. Platforms without a power
//! service wire in [`FixedHostPower`], which transitions instantly.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::time::sleep;

const TRANSITION_POLL_INTERVAL: Duration = Duration::from_secs(1);
const TRANSITION_TIMEOUT: Duration = Duration::from_secs(30);

/// Host power states relevant to firmware activation
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum HostState {
    /// Host is powered on
    On,
    /// Host is powered off
    Off,
}

/// Host power error types
#[derive(thiserror::Error, Debug)]
pub enum HostPowerError {
    /// The power service did not answer
    #[error("host power service is unavailable")]
    Unavailable,

    /// The host never reached the requested state
    #[error("host did not reach state {requested} in time")]
    TransitionTimeout {
        /// State that was requested
        requested: HostState,
    },
}

/// Interface to the platform power service
#[async_trait]
pub trait HostPower: Send + Sync {
    /// Read the current host power state
    async fn state(&self) -> Result<HostState, HostPowerError>;

    /// Request a transition; completion is observed, not assumed
    async fn request_transition(&self, state: HostState) -> Result<(), HostPowerError>;
}

/// Request a transition and poll until the host reaches it
///
/// # Errors
/// [`HostPowerError::TransitionTimeout`] when the state has not been
/// observed within the timeout, or any error from the power service.
pub async fn set_state_observed(
    power: &dyn HostPower,
    target: HostState,
) -> Result<(), HostPowerError> {
    power.request_transition(target).await?;
    debug!("requested host transition to {target}");

    let attempts = (TRANSITION_TIMEOUT.as_secs() / TRANSITION_POLL_INTERVAL.as_secs()).max(1);
    for _ in 0..attempts {
        if power.state().await? == target {
            debug!("host reached state {target}");
            return Ok(());
        }
        sleep(TRANSITION_POLL_INTERVAL).await;
    }

    Err(HostPowerError::TransitionTimeout { requested: target })
}

/// Stand-in power handle that transitions instantly
///
/// Used on platforms where no power service is wired up, and as the test
/// double for transition observation.
#[derive(Debug)]
pub struct FixedHostPower {
    state: Mutex<HostState>,
}

impl FixedHostPower {
    /// Create a handle starting in the given state
    #[must_use]
    pub fn new(state: HostState) -> Self {
        FixedHostPower {
            state: Mutex::new(state),
        }
    }
}

#[async_trait]
impl HostPower for FixedHostPower {
    async fn state(&self) -> Result<HostState, HostPowerError> {
        Ok(*self.state.lock().expect("host power lock poisoned"))
    }

    async fn request_transition(&self, state: HostState) -> Result<(), HostPowerError> {
        *self.state.lock().expect("host power lock poisoned") = state;
        Ok(())
    }
}
