//! Emergency alerts and session wiring.

mod harness;

use std::sync::{Arc, Mutex};

use circle_common::{EmergencyAlert, EmergencyKind, LocationConfig, LocationError};
use circle_location::testing::{fix_at, MockGeocoder, OnceBehavior, ScriptedPositions};
use circle_location::{InboundEmergency, InboundEvent, TrackingOptions};
use harness::{session, LOCAL_USER};

#[tokio::test]
async fn emergency_alert_carries_the_snapshot_address() {
    let t = session()
        .positions(ScriptedPositions::new().with_once(OnceBehavior::Fix(fix_at(37.0, -122.0, 0))))
        .build();
    t.session.start_tracking(TrackingOptions::default()).await;

    let alert = t
        .session
        .send_emergency_alert("Need help", EmergencyKind::Medical)
        .await
        .unwrap();

    assert_eq!(alert.location_text, "12 Elm Street, Springfield");
    assert_eq!(alert.kind, EmergencyKind::Medical);
    assert_eq!(t.transport.alerts(), vec![alert]);
}

#[tokio::test]
async fn emergency_alert_falls_back_to_coordinates() {
    let t = session()
        .geocoder(MockGeocoder::failing())
        .positions(ScriptedPositions::new().with_once(OnceBehavior::Fix(fix_at(37.123456, -122.5, 0))))
        .build();
    t.session.start_tracking(TrackingOptions::default()).await;

    let alert = t
        .session
        .send_emergency_alert("SOS", EmergencyKind::Sos)
        .await
        .unwrap();

    assert_eq!(alert.location_text, "37.12346, -122.50000");
}

#[tokio::test]
async fn emergency_alert_goes_out_without_a_fix() {
    // Permission never granted: no snapshot, alert still sent.
    let t = session().build();

    let alert = t
        .session
        .send_emergency_alert("Car accident on 5th", EmergencyKind::Accident)
        .await
        .unwrap();

    assert_eq!(alert.location_text, "Location unavailable");
    assert_eq!(t.transport.alerts().len(), 1);
}

#[tokio::test]
async fn undeliverable_emergency_alert_is_a_transport_failure() {
    let t = session().build();
    t.transport.set_fail_publish(true);

    let err = t
        .session
        .send_emergency_alert("SOS", EmergencyKind::Sos)
        .await
        .unwrap_err();

    assert!(matches!(err, LocationError::TransportFailure(_)));
}

#[tokio::test]
async fn inbound_emergencies_reach_subscribers_except_our_own_echo() {
    let t = session().build();
    let received = Arc::new(Mutex::new(Vec::<InboundEmergency>::new()));
    let sink = received.clone();
    let subscription = t
        .session
        .subscribe_emergency_alerts(move |e| sink.lock().unwrap().push(e.clone()));

    let alert = EmergencyAlert {
        message: "Fell off bike".to_string(),
        location_text: "Main St & 3rd".to_string(),
        kind: EmergencyKind::Accident,
    };
    t.session.handle_inbound(InboundEvent::EmergencyAlert {
        user_id: "sam".to_string(),
        alert: alert.clone(),
    });
    t.session.handle_inbound(InboundEvent::EmergencyAlert {
        user_id: LOCAL_USER.to_string(),
        alert: alert.clone(),
    });

    subscription.unsubscribe();
    subscription.unsubscribe();
    t.session.handle_inbound(InboundEvent::EmergencyAlert {
        user_id: "kim".to_string(),
        alert,
    });

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].user_id, "sam");
}

#[test]
fn inbound_events_decode_from_tagged_json() {
    let raw = r#"{"event":"member_location_updated","user_id":"sam","lat":37.1,"lon":-122.1,"accuracy":12.0,"timestamp":"2024-05-01T08:00:00Z"}"#;
    let event: InboundEvent = serde_json::from_str(raw).unwrap();

    match event {
        InboundEvent::MemberLocationUpdated(update) => {
            assert_eq!(update.user_id, "sam");
            assert_eq!(update.accuracy_meters, Some(12.0));
            assert!(update.address.is_none());
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn default_tracking_options_follow_config() {
    let config = LocationConfig {
        default_interval_ms: 30_000,
        ..LocationConfig::default()
    };
    let t = session().config(config).build();

    let options = t.session.default_tracking_options();
    assert_eq!(options.interval_ms, 30_000);
    assert!(options.high_accuracy);
}
