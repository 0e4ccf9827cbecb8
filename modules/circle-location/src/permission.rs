use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::listeners::lock;
use crate::traits::PermissionProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Unrequested,
    Granted,
    Denied,
}

/// Answer to a permission prompt. A prompt cannot leave the status unrequested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Granted,
    Denied,
}

impl From<PermissionDecision> for PermissionStatus {
    fn from(decision: PermissionDecision) -> Self {
        match decision {
            PermissionDecision::Granted => PermissionStatus::Granted,
            PermissionDecision::Denied => PermissionStatus::Denied,
        }
    }
}

/// Tracks the device's location-permission state and gates tracking on it.
///
/// Nothing here returns an error: a provider failure reads as `Denied`, and
/// the rest of the application keeps running without location features.
pub struct PermissionGate {
    provider: Arc<dyn PermissionProvider>,
    status: Mutex<PermissionStatus>,
}

impl PermissionGate {
    pub fn new(provider: Arc<dyn PermissionProvider>) -> Self {
        Self {
            provider,
            status: Mutex::new(PermissionStatus::Unrequested),
        }
    }

    pub fn current_status(&self) -> PermissionStatus {
        *lock(&self.status)
    }

    /// Re-read the OS status, e.g. after the user changed it in system settings.
    pub async fn refresh(&self) -> PermissionStatus {
        match self.provider.query().await {
            Ok(status) => {
                *lock(&self.status) = status;
                status
            }
            Err(e) => {
                warn!(error = %e, "Permission query failed, keeping cached status");
                self.current_status()
            }
        }
    }

    pub async fn request_permission(&self) -> PermissionDecision {
        let decision = match self.provider.request().await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, "Permission request failed, treating as denied");
                PermissionDecision::Denied
            }
        };

        *lock(&self.status) = decision.into();
        match decision {
            PermissionDecision::Granted => info!("Location permission granted"),
            PermissionDecision::Denied => warn!("Location permission denied"),
        }
        decision
    }

    /// `true` when tracking may start, prompting first if needed.
    pub async fn ensure_granted(&self) -> bool {
        if self.current_status() == PermissionStatus::Granted {
            return true;
        }
        self.request_permission().await == PermissionDecision::Granted
    }
}
