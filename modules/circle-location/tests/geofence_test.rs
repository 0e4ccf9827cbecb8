//! Geofence crossings driven end to end through a live tracking session.

mod harness;

use std::sync::{Arc, Mutex};

use circle_common::{Geofence, GeofenceKind, GeofenceUpdate, SafetyZone, ZoneKind};
use circle_location::testing::{fix_at_distance, sample_at_distance, HOME};
use circle_location::{GeofenceEngine, GeofenceTransition, TrackingOptions};
use harness::{next_sample, session, LOCAL_USER};

const OUT_AND_BACK: [f64; 9] = [500.0, 400.0, 300.0, 150.0, 50.0, 50.0, 150.0, 300.0, 500.0];

fn school_fence() -> Geofence {
    Geofence::new("School", HOME.0, HOME.1, 200.0, GeofenceKind::School, "family")
}

#[test]
fn crossing_in_and_out_raises_enter_then_exit_at_any_cadence() {
    for repeat in 1..=4 {
        let engine = GeofenceEngine::new(LOCAL_USER);
        engine.register(school_fence()).unwrap();

        let mut transitions = Vec::new();
        let mut secs = 0;
        for meters in OUT_AND_BACK {
            for _ in 0..repeat {
                secs += 15;
                transitions.extend(
                    engine
                        .evaluate(&sample_at_distance(HOME, meters, secs))
                        .into_iter()
                        .map(|e| e.transition),
                );
            }
        }

        assert_eq!(
            transitions,
            vec![GeofenceTransition::Enter, GeofenceTransition::Exit],
            "repeat = {repeat}"
        );
    }
}

#[tokio::test]
async fn tracked_fixes_cross_the_school_fence_once_each_way() {
    let t = session().build();
    t.session.geofences().register(school_fence()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    t.session.geofences().subscribe(move |event| {
        sink.lock().unwrap().push((event.transition, event.user_id.clone()));
    });

    let mut samples = t.local_samples();
    t.session.start_tracking(TrackingOptions::default()).await;
    for (i, meters) in OUT_AND_BACK.into_iter().enumerate() {
        t.positions.push(fix_at_distance(HOME, meters, i as i64 * 10));
    }
    for _ in OUT_AND_BACK {
        next_sample(&mut samples).await;
    }

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            (GeofenceTransition::Enter, LOCAL_USER.to_string()),
            (GeofenceTransition::Exit, LOCAL_USER.to_string()),
        ]
    );
}

#[tokio::test]
async fn geofences_and_safety_zones_see_the_same_sample() {
    let t = session().build();
    t.session.geofences().register(school_fence()).unwrap();
    t.session
        .safety_zones()
        .register(SafetyZone::new("Creek", HOME.0, HOME.1, 100.0, ZoneKind::Danger, "family"))
        .unwrap();

    let alerts = Arc::new(Mutex::new(0usize));
    let counter = alerts.clone();
    t.session.safety_zones().subscribe(move |_| *counter.lock().unwrap() += 1);

    let mut samples = t.local_samples();
    t.session.start_tracking(TrackingOptions::default()).await;
    for i in 0..3 {
        t.positions.push(fix_at_distance(HOME, 50.0, i * 10));
    }
    for _ in 0..3 {
        next_sample(&mut samples).await;
    }

    // Level-triggered zone alerts every time; the fence entered once.
    assert_eq!(*alerts.lock().unwrap(), 3);
    let fence_id = t.session.geofences().list_active()[0].id;
    assert_eq!(t.session.geofences().is_inside(fence_id), Some(true));
}

#[test]
fn deactivating_a_fence_forgets_containment() {
    let engine = GeofenceEngine::new(LOCAL_USER);
    let fence = school_fence();
    let id = fence.id;
    engine.register(fence).unwrap();
    engine.evaluate(&sample_at_distance(HOME, 50.0, 0));
    assert_eq!(engine.is_inside(id), Some(true));

    engine
        .update(id, &GeofenceUpdate { active: Some(false), ..Default::default() })
        .unwrap();
    assert!(engine.list_active().is_empty());
    assert!(engine.evaluate(&sample_at_distance(HOME, 500.0, 10)).is_empty());

    engine
        .update(id, &GeofenceUpdate { active: Some(true), ..Default::default() })
        .unwrap();
    let events = engine.evaluate(&sample_at_distance(HOME, 50.0, 20));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].transition, GeofenceTransition::Enter);
}

#[test]
fn fence_scoped_to_other_members_is_ignored() {
    let engine = GeofenceEngine::new(LOCAL_USER);
    engine
        .register(school_fence().with_members(["sam", "kim"]))
        .unwrap();

    assert!(engine.evaluate(&sample_at_distance(HOME, 50.0, 0)).is_empty());
}
