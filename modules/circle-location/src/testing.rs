// Test fakes for the location core.
//
// One fake per trait boundary:
// - MockPermissions (PermissionProvider): scripted OS status and prompt answer
// - ScriptedPositions (PositionProvider): push fixes into a live watch by hand
// - MockGeocoder (GeocodeResolver): fixed annotation, failure, or stall
// - MemoryTransport (RealtimeTransport): records outbound traffic, injects inbound
//
// Plus helpers for building fixes, samples and remote updates at known
// distances from a point.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;

use circle_common::{
    offset_meters, Annotation, EmergencyAlert, LocationSample, OutboundLocation, PlaceLabel,
    RawFix, RemoteLocationUpdate,
};

use crate::listeners::lock;
use crate::permission::{PermissionDecision, PermissionStatus};
use crate::traits::{
    FixOptions, FixStream, GeocodeResolver, InboundEvent, InboundStream, PermissionProvider,
    PositionProvider, RealtimeTransport, WatchOptions,
};

// ---------------------------------------------------------------------------
// Test constants
// ---------------------------------------------------------------------------

/// Palo Alto-ish reference point used across scenarios.
pub const HOME: (f64, f64) = (37.0, -122.0);
/// Roughly 1.1 km north of `HOME`.
pub const SCHOOL: (f64, f64) = (37.01, -122.0);
/// Accuracy reported by every fake fix.
pub const FIX_ACCURACY_M: f64 = 8.0;

/// Fixed reference instant so tests never depend on the wall clock.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub fn fix_at(lat: f64, lon: f64, offset_secs: i64) -> RawFix {
    RawFix::new(lat, lon, FIX_ACCURACY_M, base_time() + ChronoDuration::seconds(offset_secs))
}

/// Fix placed `meters` due north of `center`.
pub fn fix_at_distance(center: (f64, f64), meters: f64, offset_secs: i64) -> RawFix {
    let (lat, lon) = offset_meters(center.0, center.1, meters, 0.0);
    fix_at(lat, lon, offset_secs)
}

pub fn sample_at(lat: f64, lon: f64) -> LocationSample {
    LocationSample::from_fix(&fix_at(lat, lon, 0))
}

/// Sample placed `meters` due north of `center`, captured `offset_secs`
/// after `base_time()`.
pub fn sample_at_distance(center: (f64, f64), meters: f64, offset_secs: i64) -> LocationSample {
    LocationSample::from_fix(&fix_at_distance(center, meters, offset_secs))
}

pub fn remote_update(user_id: &str, lat: f64, lon: f64) -> RemoteLocationUpdate {
    RemoteLocationUpdate {
        user_id: user_id.to_string(),
        latitude: lat,
        longitude: lon,
        accuracy_meters: Some(FIX_ACCURACY_M),
        address: None,
        captured_at: base_time(),
    }
}

// ---------------------------------------------------------------------------
// MockPermissions
// ---------------------------------------------------------------------------

/// OS permission API. `None` as the prompt answer makes `request()` error.
pub struct MockPermissions {
    os_status: Mutex<PermissionStatus>,
    prompt_answer: Option<PermissionDecision>,
    request_calls: AtomicUsize,
}

impl MockPermissions {
    pub fn prompts_to(decision: PermissionDecision) -> Self {
        Self {
            os_status: Mutex::new(PermissionStatus::Unrequested),
            prompt_answer: Some(decision),
            request_calls: AtomicUsize::new(0),
        }
    }

    pub fn granted() -> Self {
        Self::prompts_to(PermissionDecision::Granted)
    }

    pub fn denied() -> Self {
        Self::prompts_to(PermissionDecision::Denied)
    }

    pub fn failing() -> Self {
        Self {
            os_status: Mutex::new(PermissionStatus::Unrequested),
            prompt_answer: None,
            request_calls: AtomicUsize::new(0),
        }
    }

    /// Simulate the user flipping the toggle in system settings.
    pub fn set_os_status(&self, status: PermissionStatus) {
        *lock(&self.os_status) = status;
    }

    pub fn request_calls(&self) -> usize {
        self.request_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionProvider for MockPermissions {
    async fn query(&self) -> Result<PermissionStatus> {
        Ok(*lock(&self.os_status))
    }

    async fn request(&self) -> Result<PermissionDecision> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        let Some(decision) = self.prompt_answer else {
            bail!("permission dialog unavailable");
        };
        *lock(&self.os_status) = decision.into();
        Ok(decision)
    }
}

// ---------------------------------------------------------------------------
// ScriptedPositions
// ---------------------------------------------------------------------------

/// How `get_once` answers.
#[derive(Debug, Clone, Copy)]
pub enum OnceBehavior {
    Fix(RawFix),
    Fail,
    /// Never resolves; the caller's timeout decides.
    Hang,
}

/// Position provider driven by the test. Each `watch()` opens a fresh
/// channel; `push` feeds the most recent one.
pub struct ScriptedPositions {
    watch_tx: Mutex<Option<UnboundedSender<Result<RawFix>>>>,
    watch_options: Mutex<Vec<WatchOptions>>,
    fail_watch: AtomicBool,
    once: Mutex<OnceBehavior>,
    once_options: Mutex<Vec<FixOptions>>,
}

impl ScriptedPositions {
    pub fn new() -> Self {
        Self {
            watch_tx: Mutex::new(None),
            watch_options: Mutex::new(Vec::new()),
            fail_watch: AtomicBool::new(false),
            once: Mutex::new(OnceBehavior::Fail),
            once_options: Mutex::new(Vec::new()),
        }
    }

    pub fn with_once(self, behavior: OnceBehavior) -> Self {
        *lock(&self.once) = behavior;
        self
    }

    pub fn failing_watch(self) -> Self {
        self.fail_watch.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_once(&self, behavior: OnceBehavior) {
        *lock(&self.once) = behavior;
    }

    /// Deliver a fix on the live watch. `false` when no watch is listening.
    pub fn push(&self, fix: RawFix) -> bool {
        match lock(&self.watch_tx).as_ref() {
            Some(tx) => tx.unbounded_send(Ok(fix)).is_ok(),
            None => false,
        }
    }

    /// Make the live watch report an error.
    pub fn fail(&self, message: &str) -> bool {
        match lock(&self.watch_tx).as_ref() {
            Some(tx) => tx.unbounded_send(Err(anyhow!(message.to_string()))).is_ok(),
            None => false,
        }
    }

    /// End the live watch stream.
    pub fn close(&self) {
        lock(&self.watch_tx).take();
    }

    /// Whether the consumer still holds the latest watch stream.
    pub fn is_watching(&self) -> bool {
        lock(&self.watch_tx)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn watch_calls(&self) -> usize {
        lock(&self.watch_options).len()
    }

    pub fn last_watch_options(&self) -> Option<WatchOptions> {
        lock(&self.watch_options).last().copied()
    }

    pub fn once_calls(&self) -> Vec<FixOptions> {
        lock(&self.once_options).clone()
    }
}

impl Default for ScriptedPositions {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PositionProvider for ScriptedPositions {
    async fn watch(&self, options: WatchOptions) -> Result<FixStream> {
        lock(&self.watch_options).push(options);
        if self.fail_watch.load(Ordering::SeqCst) {
            bail!("location services disabled");
        }
        let (tx, rx) = unbounded();
        *lock(&self.watch_tx) = Some(tx);
        Ok(rx.boxed())
    }

    async fn get_once(&self, options: FixOptions) -> Result<RawFix> {
        lock(&self.once_options).push(options);
        let behavior = *lock(&self.once);
        match behavior {
            OnceBehavior::Fix(fix) => Ok(fix),
            OnceBehavior::Fail => bail!("no fix available"),
            OnceBehavior::Hang => futures::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// MockGeocoder
// ---------------------------------------------------------------------------

pub enum GeocodeBehavior {
    Fixed(Annotation),
    Fail,
    Hang,
}

pub struct MockGeocoder {
    behavior: Mutex<GeocodeBehavior>,
    calls: AtomicUsize,
}

impl MockGeocoder {
    pub fn fixed(address: &str, label: PlaceLabel) -> Self {
        Self::with(GeocodeBehavior::Fixed(Annotation {
            address: Some(address.to_string()),
            place_label: Some(label),
        }))
    }

    pub fn failing() -> Self {
        Self::with(GeocodeBehavior::Fail)
    }

    pub fn hanging() -> Self {
        Self::with(GeocodeBehavior::Hang)
    }

    fn with(behavior: GeocodeBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: GeocodeBehavior) {
        *lock(&self.behavior) = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeocodeResolver for MockGeocoder {
    async fn resolve(&self, _lat: f64, _lon: f64) -> Result<Annotation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let annotation = match &*lock(&self.behavior) {
            GeocodeBehavior::Fixed(annotation) => Some(annotation.clone()),
            GeocodeBehavior::Fail => bail!("geocoder unreachable"),
            GeocodeBehavior::Hang => None,
        };
        match annotation {
            Some(annotation) => Ok(annotation),
            None => futures::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

/// In-memory realtime channel. Records everything published and lets the
/// test inject inbound events.
pub struct MemoryTransport {
    published: Mutex<Vec<OutboundLocation>>,
    alerts: Mutex<Vec<EmergencyAlert>>,
    fail_publish: AtomicBool,
    stall_publish: AtomicBool,
    inbound_tx: Mutex<Option<UnboundedSender<InboundEvent>>>,
    inbound_rx: Mutex<Option<UnboundedReceiver<InboundEvent>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            published: Mutex::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
            stall_publish: AtomicBool::new(false),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
        }
    }

    /// Every publish returns an error.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Every publish hangs until the caller gives up.
    pub fn set_stall_publish(&self, stall: bool) {
        self.stall_publish.store(stall, Ordering::SeqCst);
    }

    pub fn inject(&self, event: InboundEvent) -> bool {
        match lock(&self.inbound_tx).as_ref() {
            Some(tx) => tx.unbounded_send(event).is_ok(),
            None => false,
        }
    }

    pub fn close_inbound(&self) {
        lock(&self.inbound_tx).take();
    }

    pub fn published(&self) -> Vec<OutboundLocation> {
        lock(&self.published).clone()
    }

    pub fn alerts(&self) -> Vec<EmergencyAlert> {
        lock(&self.alerts).clone()
    }

    async fn gate_publish(&self) -> Result<()> {
        if self.stall_publish.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            bail!("socket disconnected");
        }
        Ok(())
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn publish_location(&self, location: &OutboundLocation) -> Result<()> {
        self.gate_publish().await?;
        lock(&self.published).push(location.clone());
        Ok(())
    }

    async fn publish_emergency_alert(&self, alert: &EmergencyAlert) -> Result<()> {
        self.gate_publish().await?;
        lock(&self.alerts).push(alert.clone());
        Ok(())
    }

    async fn inbound(&self) -> Result<InboundStream> {
        match lock(&self.inbound_rx).take() {
            Some(rx) => Ok(rx.boxed()),
            None => bail!("inbound channel already subscribed"),
        }
    }
}
