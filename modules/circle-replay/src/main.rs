//! Development tool. Replays a scenario file through a `CircleSession` whose
//! positions, permissions and realtime channel are the in-memory fakes from
//! `circle_location::testing`, then prints what the location core did.

mod scenario;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use circle_common::{
    Annotation, CircleMemberLocation, EmergencyAlert, LocationConfig, LocationSample, PlaceLabel,
    ZoneKind,
};
use circle_location::geocode::classify_place;
use circle_location::testing::{MemoryTransport, MockPermissions, OnceBehavior, ScriptedPositions};
use circle_location::{
    CircleSession, GeocodeResolver, GeofenceTransition, InboundEvent, NominatimGeocoder,
    SavedPlace, SessionDeps, StartOutcome, TrackingOptions,
};

use scenario::{Scenario, Step};

#[derive(Parser)]
#[command(
    name = "circle-replay",
    about = "Replay a recorded circle scenario through the location core"
)]
struct Cli {
    /// Scenario JSON file
    scenario: PathBuf,

    /// Reverse-geocode samples against Nominatim instead of saved places only
    #[arg(long)]
    online_geocode: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// Labels samples from the scenario's home/work geofences, no network.
struct SavedPlaceGeocoder {
    places: Vec<SavedPlace>,
}

#[async_trait]
impl GeocodeResolver for SavedPlaceGeocoder {
    async fn resolve(&self, lat: f64, lon: f64) -> Result<Annotation> {
        Ok(Annotation {
            address: None,
            place_label: Some(classify_place(lat, lon, None, &self.places)),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplayEvent {
    Sample {
        at: DateTime<Utc>,
        lat: f64,
        lon: f64,
        place_label: Option<PlaceLabel>,
    },
    Geofence {
        at: DateTime<Utc>,
        fence: String,
        transition: GeofenceTransition,
        distance_meters: f64,
    },
    SafetyAlert {
        at: DateTime<Utc>,
        zone: String,
        kind: ZoneKind,
        distance_meters: f64,
    },
    EmergencySent {
        alert: EmergencyAlert,
    },
}

#[derive(Debug, Serialize)]
struct ReplayReport {
    scenario: String,
    events: Vec<ReplayEvent>,
    published_locations: usize,
    members: Vec<CircleMemberLocation>,
}

/// Longest we wait for one fix to come out the far end of the pipeline.
const SAMPLE_WAIT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = LocationConfig::from_env()?;
    let scenario = Scenario::load(&cli.scenario)?;
    info!(scenario = scenario.name.as_str(), steps = scenario.steps.len(), "Replaying scenario");

    let report = replay(&scenario, config, cli.online_geocode).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("circle_location=info,circle_replay=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn replay(scenario: &Scenario, config: LocationConfig, online: bool) -> Result<ReplayReport> {
    // Every replayed fix is annotated before evaluation so reports are stable.
    let config = LocationConfig {
        annotation_window: config.geocode_timeout,
        ..config
    };
    let publish_timeout = config.publish_timeout;
    let fences = scenario.geofences();
    let saved_places: Vec<SavedPlace> = fences.iter().filter_map(SavedPlace::from_geofence).collect();

    let geocoder: Arc<dyn GeocodeResolver> = if online {
        let nominatim = NominatimGeocoder::from_config(&config)
            .context("Failed to build Nominatim client")?;
        nominatim.set_saved_places(saved_places);
        Arc::new(nominatim)
    } else {
        Arc::new(SavedPlaceGeocoder {
            places: saved_places,
        })
    };

    let positions = Arc::new(ScriptedPositions::new());
    let transport = Arc::new(MemoryTransport::new());
    let deps = SessionDeps::builder()
        .permissions(Arc::new(MockPermissions::granted()))
        .positions(positions.clone())
        .geocoder(geocoder)
        .transport(transport.clone())
        .config(config)
        .build();
    let session = CircleSession::new(
        deps,
        scenario.local_user.user_id.clone(),
        scenario.local_user.user_name.clone(),
    );

    session.set_roster(scenario.roster.clone());
    for fence in fences {
        session.geofences().register(fence)?;
    }
    for zone in scenario.safety_zones() {
        session.safety_zones().register(zone)?;
    }

    let events = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = events.clone();
        session.geofences().subscribe(move |event| {
            push(&sink, ReplayEvent::Geofence {
                at: event.sample.captured_at,
                fence: event.geofence_name.clone(),
                transition: event.transition,
                distance_meters: event.distance_meters.round(),
            });
        });
    }
    {
        let sink = events.clone();
        session.safety_zones().subscribe(move |alert| {
            push(&sink, ReplayEvent::SafetyAlert {
                at: alert.sample.captured_at,
                zone: alert.zone_name.clone(),
                kind: alert.zone_kind,
                distance_meters: alert.distance_meters.round(),
            });
        });
    }
    let (sample_tx, mut samples) = mpsc::unbounded_channel::<LocationSample>();
    {
        let sink = events.clone();
        session.tracker().subscribe(move |sample| {
            push(&sink, ReplayEvent::Sample {
                at: sample.captured_at,
                lat: sample.latitude,
                lon: sample.longitude,
                place_label: sample.place_label,
            });
            let _ = sample_tx.send(sample.clone());
        });
    }

    for step in &scenario.steps {
        match step {
            Step::Start { interval_ms } => {
                let mut options = session.default_tracking_options();
                if let Some(interval_ms) = interval_ms {
                    options.interval_ms = *interval_ms;
                }
                let outcome = session.start_tracking(options).await;
                if !matches!(outcome, StartOutcome::Active | StartOutcome::AlreadyActive) {
                    warn!(?outcome, "Tracking did not start");
                }
            }
            Step::Stop => session.stop_tracking(),
            Step::Fix { lat, lon, accuracy, at_secs } => {
                let fix = scenario.fix(*lat, *lon, *accuracy, *at_secs);
                // Discard samples not tied to a step, e.g. an immediate fix.
                while samples.try_recv().is_ok() {}
                if !positions.push(fix) {
                    warn!(at_secs, "Tracker not watching, fix dropped");
                    continue;
                }
                // A later emergency snapshot resolves to the latest fix.
                positions.set_once(OnceBehavior::Fix(fix));
                tokio::time::timeout(SAMPLE_WAIT, samples.recv())
                    .await
                    .context("Sample pipeline stalled")?;
            }
            Step::Remote { user_id, lat, lon, address, at_secs } => {
                let update = scenario.remote(user_id, *lat, *lon, address.clone(), *at_secs);
                session.handle_inbound(InboundEvent::MemberLocationUpdated(update));
            }
            Step::Presence { user_id, online } => {
                session.handle_inbound(InboundEvent::MemberPresence {
                    user_id: user_id.clone(),
                    online: *online,
                });
            }
            Step::Emergency { message, kind } => {
                match session.send_emergency_alert(message.clone(), *kind).await {
                    Ok(alert) => push(&events, ReplayEvent::EmergencySent { alert }),
                    Err(e) => warn!(error = %e, "Emergency alert failed"),
                }
            }
        }
    }

    let events = std::mem::take(&mut *events.lock().unwrap_or_else(|e| e.into_inner()));
    let processed = events
        .iter()
        .filter(|e| matches!(e, ReplayEvent::Sample { .. }))
        .count();
    wait_for_publishes(&transport, processed, publish_timeout).await;

    Ok(ReplayReport {
        scenario: scenario.name.clone(),
        events,
        published_locations: transport.published().len(),
        members: session.aggregator().members(),
    })
}

/// Publishing runs on its own task; give the outbound queue a chance to
/// drain before counting.
async fn wait_for_publishes(transport: &MemoryTransport, expected: usize, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while transport.published().len() < expected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn push(sink: &Mutex<Vec<ReplayEvent>>, event: ReplayEvent) {
    sink.lock().unwrap_or_else(|e| e.into_inner()).push(event);
}
