//! Trait boundaries for everything the core consumes but does not own.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use circle_common::{
    Annotation, EmergencyAlert, OutboundLocation, RawFix, RemoteLocationUpdate,
};

use crate::permission::{PermissionDecision, PermissionStatus};

/// Continuous position fixes. An `Err` item means the watch itself failed.
pub type FixStream = BoxStream<'static, Result<RawFix>>;

/// Inbound realtime events. The stream ends when the channel closes.
pub type InboundStream = BoxStream<'static, InboundEvent>;

/// Parameters for a continuous watch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    pub background: bool,
    pub interval_ms: u64,
    /// Minimum movement before the provider reports a new fix.
    pub min_displacement_meters: f64,
}

/// Parameters for a single fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Oldest cached fix the provider may return. Zero forces a fresh one.
    pub maximum_age: Duration,
}

/// Device location-permission API.
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Current status without prompting the user.
    async fn query(&self) -> Result<PermissionStatus>;

    /// Prompt for location access.
    async fn request(&self) -> Result<PermissionDecision>;
}

/// Device position API.
#[async_trait]
pub trait PositionProvider: Send + Sync {
    /// Begin a continuous watch. Dropping the stream releases the watch.
    async fn watch(&self, options: WatchOptions) -> Result<FixStream>;

    /// Resolve a single fix.
    async fn get_once(&self, options: FixOptions) -> Result<RawFix>;
}

/// Reverse geocoder. Best-effort: callers treat any error as "no annotation".
#[async_trait]
pub trait GeocodeResolver: Send + Sync {
    async fn resolve(&self, lat: f64, lon: f64) -> Result<Annotation>;
}

/// Events the realtime channel delivers to this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundEvent {
    MemberLocationUpdated(RemoteLocationUpdate),
    MemberPresence { user_id: String, online: bool },
    EmergencyAlert { user_id: String, alert: EmergencyAlert },
}

/// The persistent bidirectional channel to the circle's other members.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn publish_location(&self, location: &OutboundLocation) -> Result<()>;

    async fn publish_emergency_alert(&self, alert: &EmergencyAlert) -> Result<()>;

    /// Subscribe to inbound member events.
    async fn inbound(&self) -> Result<InboundStream>;
}
