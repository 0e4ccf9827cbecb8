use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Position fix timed out after {0}ms")]
    AcquisitionTimeout(u64),

    #[error("Position acquisition failed: {0}")]
    AcquisitionFailure(String),

    #[error("Reverse geocoding failed: {0}")]
    AnnotationFailure(String),

    #[error("Realtime transport error: {0}")]
    TransportFailure(String),

    #[error("Radius must be strictly positive, got {0}")]
    InvalidRadius(f64),

    #[error("Invalid coordinate ({lat}, {lon})")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("Geofence not found: {0}")]
    GeofenceNotFound(Uuid),

    #[error("Safety zone not found: {0}")]
    SafetyZoneNotFound(Uuid),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl LocationError {
    /// Errors that move the tracker's state machine. Everything else is
    /// local to one pipeline stage.
    pub fn affects_tracker(&self) -> bool {
        matches!(
            self,
            LocationError::PermissionDenied | LocationError::AcquisitionFailure(_)
        )
    }
}
