//! Location and geofencing core for a circle (family/friend group) session.
//!
//! The device's own position stream flows through the `LocationTracker`,
//! gets annotated, evaluated against geofences and safety zones, published
//! on the realtime channel, and merged with other members' positions by the
//! `CircleLocationAggregator`. Every outside dependency (permissions, the
//! position provider, the geocoder, the realtime transport) enters through a
//! trait in `traits`, so a `CircleSession` is assembled explicitly rather
//! than reached through globals.

pub mod aggregator;
pub mod geocode;
pub mod geofence;
pub mod listeners;
pub mod permission;
mod pipeline;
pub mod safety;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod tracker;
pub mod traits;

pub use aggregator::CircleLocationAggregator;
pub use geocode::{NominatimGeocoder, SavedPlace};
pub use geofence::{GeofenceEngine, GeofenceEvent, GeofenceTransition};
pub use listeners::{Listeners, Subscription};
pub use permission::{PermissionDecision, PermissionGate, PermissionStatus};
pub use safety::{AlertThrottle, SafetyAlert, SafetyZoneMonitor};
pub use session::{CircleSession, InboundEmergency, SessionDeps};
pub use tracker::{LocationTracker, StartOutcome, TrackerState, TrackingOptions};
pub use traits::{
    FixOptions, FixStream, GeocodeResolver, InboundEvent, InboundStream, PermissionProvider,
    PositionProvider, RealtimeTransport, WatchOptions,
};
