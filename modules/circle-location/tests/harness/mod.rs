//! Shared setup for the location integration tests.
//!
//! Builds a `CircleSession` around the in-memory fakes and keeps a handle on
//! each fake so tests can drive positions and inspect outbound traffic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use circle_common::{LocationConfig, LocationSample, PlaceLabel};
use circle_location::testing::{MemoryTransport, MockGeocoder, MockPermissions, ScriptedPositions};
use circle_location::{CircleSession, SessionDeps};

pub const LOCAL_USER: &str = "alex";

/// Upper bound for any single wait. Generous so paused-clock tests can
/// run through the geocode and publish timeouts.
pub const WAIT: Duration = Duration::from_secs(30);

pub struct TestSession {
    pub session: CircleSession,
    pub permissions: Arc<MockPermissions>,
    pub positions: Arc<ScriptedPositions>,
    pub geocoder: Arc<MockGeocoder>,
    pub transport: Arc<MemoryTransport>,
}

pub struct Builder {
    permissions: MockPermissions,
    positions: ScriptedPositions,
    geocoder: MockGeocoder,
    config: LocationConfig,
}

impl Builder {
    pub fn permissions(mut self, permissions: MockPermissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn positions(mut self, positions: ScriptedPositions) -> Self {
        self.positions = positions;
        self
    }

    pub fn geocoder(mut self, geocoder: MockGeocoder) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn config(mut self, config: LocationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> TestSession {
        let permissions = Arc::new(self.permissions);
        let positions = Arc::new(self.positions);
        let geocoder = Arc::new(self.geocoder);
        let transport = Arc::new(MemoryTransport::new());

        let deps = SessionDeps::builder()
            .permissions(permissions.clone())
            .positions(positions.clone())
            .geocoder(geocoder.clone())
            .transport(transport.clone())
            .config(self.config)
            .build();

        TestSession {
            session: CircleSession::new(deps, LOCAL_USER, "Alex"),
            permissions,
            positions,
            geocoder,
            transport,
        }
    }
}

pub fn session() -> Builder {
    Builder {
        permissions: MockPermissions::granted(),
        positions: ScriptedPositions::new(),
        geocoder: MockGeocoder::fixed("12 Elm Street, Springfield", PlaceLabel::Neighborhood),
        config: LocationConfig::default(),
    }
}

impl TestSession {
    /// Channel that receives every processed local sample.
    pub fn local_samples(&self) -> mpsc::UnboundedReceiver<LocationSample> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.session.tracker().subscribe(move |sample| {
            let _ = tx.send(sample.clone());
        });
        rx
    }
}

pub async fn next_sample(rx: &mut mpsc::UnboundedReceiver<LocationSample>) -> LocationSample {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a sample")
        .expect("sample channel closed")
}

/// Poll `check` until it holds or `WAIT` runs out.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
