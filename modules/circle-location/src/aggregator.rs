//! "Where is everyone in my circle right now."
//!
//! Merges the local device's latest sample with remote member updates into
//! one ordered list: the local user first, then the rest of the roster in
//! roster order. Only roster members appear, and the local user appears
//! exactly once no matter what the realtime channel echoes back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use circle_common::{
    validate_coordinate, CircleMemberLocation, LocationSample, RemoteLocationUpdate, RosterMember,
};

use crate::listeners::{lock, Listeners, Subscription};

/// Last known position of a remote member. Name and circle come from the
/// roster at merge time so a roster switch relabels everyone at once.
#[derive(Debug, Clone)]
struct RemotePosition {
    latitude: f64,
    longitude: f64,
    accuracy_meters: Option<f64>,
    captured_at: chrono::DateTime<chrono::Utc>,
    address: Option<String>,
    is_online: bool,
}

#[derive(Default)]
struct AggregatorState {
    roster: Vec<RosterMember>,
    local_sample: Option<LocationSample>,
    remote: HashMap<String, RemotePosition>,
    version: u64,
}

struct MergedView {
    version: u64,
    members: Vec<CircleMemberLocation>,
}

pub struct CircleLocationAggregator {
    local_user_id: String,
    local_user_name: String,
    state: Mutex<AggregatorState>,
    listeners: Listeners<MergedView>,
}

impl CircleLocationAggregator {
    pub fn new(local_user_id: impl Into<String>, local_user_name: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            local_user_name: local_user_name.into(),
            state: Mutex::new(AggregatorState::default()),
            listeners: Listeners::new(),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn local_user_name(&self) -> &str {
        &self.local_user_name
    }

    /// Replace the known members, e.g. on circle switch. Remote positions of
    /// users no longer on the roster are dropped. The local user shows up in
    /// the merged view only while they are on the roster.
    pub fn set_membership_roster(&self, members: Vec<RosterMember>) {
        self.mutate(|state| {
            let mut roster: Vec<RosterMember> = Vec::with_capacity(members.len());
            for member in members {
                if !roster.iter().any(|m| m.user_id == member.user_id) {
                    roster.push(member);
                }
            }
            state
                .remote
                .retain(|user_id, _| roster.iter().any(|m| &m.user_id == user_id));
            state.roster = roster;
            true
        });
    }

    pub fn ingest_local(&self, sample: &LocationSample) {
        self.mutate(|state| {
            state.local_sample = Some(sample.clone());
            true
        });
    }

    /// Apply a remote member update. Returns whether the merged view changed.
    ///
    /// Known members are replaced in arrival order; updates for users off the
    /// roster and echoes of the local user are dropped.
    pub fn ingest_remote(&self, update: RemoteLocationUpdate) -> bool {
        if update.user_id == self.local_user_id {
            debug!(user_id = update.user_id.as_str(), "Ignoring remote echo of local user");
            return false;
        }
        if let Err(e) = validate_coordinate(update.latitude, update.longitude) {
            warn!(user_id = update.user_id.as_str(), error = %e, "Dropping remote update");
            return false;
        }

        self.mutate(|state| {
            if !state.roster.iter().any(|m| m.user_id == update.user_id) {
                debug!(user_id = update.user_id.as_str(), "Ignoring update for unknown member");
                return false;
            }
            let position = RemotePosition {
                latitude: update.latitude,
                longitude: update.longitude,
                accuracy_meters: update.accuracy_meters,
                captured_at: update.captured_at,
                address: update.address.clone(),
                is_online: true,
            };
            state.remote.insert(update.user_id.clone(), position);
            true
        })
    }

    /// Mark a remote member online/offline without moving them.
    pub fn set_presence(&self, user_id: &str, online: bool) -> bool {
        if user_id == self.local_user_id {
            return false;
        }
        self.mutate(|state| match state.remote.get_mut(user_id) {
            Some(entry) if entry.is_online != online => {
                entry.is_online = online;
                true
            }
            _ => false,
        })
    }

    pub fn roster(&self) -> Vec<RosterMember> {
        lock(&self.state).roster.clone()
    }

    /// Current merged view.
    pub fn members(&self) -> Vec<CircleMemberLocation> {
        self.merged(&lock(&self.state))
    }

    /// Register a listener. It is called right away with the current view,
    /// then again after every change. A listener never sees a view older
    /// than one it has already been handed.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Vec<CircleMemberLocation>) + Send + Sync + 'static,
    {
        let gate = Arc::new(VersionGate::new(callback));

        // Registering under the state lock means any change after the
        // snapshot is emitted to this listener.
        let (subscription, snapshot) = {
            let state = lock(&self.state);
            let subscription = {
                let gate = gate.clone();
                self.listeners
                    .subscribe(move |view: &MergedView| gate.deliver(view))
            };
            (subscription, MergedView {
                version: state.version,
                members: self.merged(&state),
            })
        };

        gate.deliver(&snapshot);
        subscription
    }

    fn mutate<F>(&self, change: F) -> bool
    where
        F: FnOnce(&mut AggregatorState) -> bool,
    {
        let view = {
            let mut state = lock(&self.state);
            if !change(&mut state) {
                return false;
            }
            state.version += 1;
            MergedView {
                version: state.version,
                members: self.merged(&state),
            }
        };

        self.listeners.emit(&view);
        true
    }

    fn merged(&self, state: &AggregatorState) -> Vec<CircleMemberLocation> {
        let mut view = Vec::with_capacity(state.roster.len());

        if let (Some(sample), Some(me)) = (
            &state.local_sample,
            state.roster.iter().find(|m| m.user_id == self.local_user_id),
        ) {
            view.push(CircleMemberLocation {
                user_id: self.local_user_id.clone(),
                user_name: me.user_name.clone(),
                circle_id: me.circle_id.clone(),
                latitude: sample.latitude,
                longitude: sample.longitude,
                accuracy_meters: Some(sample.accuracy_meters),
                captured_at: sample.captured_at,
                address: sample.address.clone(),
                place_label: sample.place_label,
                is_online: true,
            });
        }

        view.extend(
            state
                .roster
                .iter()
                .filter(|m| m.user_id != self.local_user_id)
                .filter_map(|m| {
                    let position = state.remote.get(&m.user_id)?;
                    Some(CircleMemberLocation {
                        user_id: m.user_id.clone(),
                        user_name: m.user_name.clone(),
                        circle_id: m.circle_id.clone(),
                        latitude: position.latitude,
                        longitude: position.longitude,
                        accuracy_meters: position.accuracy_meters,
                        captured_at: position.captured_at,
                        address: position.address.clone(),
                        place_label: None,
                        is_online: position.is_online,
                    })
                }),
        );
        view
    }
}

/// Per-listener filter: mutations emit outside the state lock and can land
/// out of order, so each listener only accepts views newer than the last
/// one it was given.
struct VersionGate<F> {
    // One past the newest version delivered; zero means nothing yet.
    delivered: AtomicU64,
    callback: F,
}

impl<F> VersionGate<F>
where
    F: Fn(&Vec<CircleMemberLocation>),
{
    fn new(callback: F) -> Self {
        Self {
            delivered: AtomicU64::new(0),
            callback,
        }
    }

    fn deliver(&self, view: &MergedView) {
        let marker = view.version + 1;
        if self.delivered.fetch_max(marker, Ordering::SeqCst) < marker {
            (self.callback)(&view.members);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{remote_update, sample_at};
    use std::sync::Arc;

    fn roster() -> Vec<RosterMember> {
        vec![
            RosterMember::new("me", "Alex", "family"),
            RosterMember::new("sam", "Sam", "family"),
            RosterMember::new("kim", "Kim", "family"),
        ]
    }

    fn ids(view: &[CircleMemberLocation]) -> Vec<&str> {
        view.iter().map(|m| m.user_id.as_str()).collect()
    }

    #[test]
    fn local_first_then_roster_order() {
        let agg = CircleLocationAggregator::new("me", "Alex");
        agg.set_membership_roster(roster());

        agg.ingest_remote(remote_update("kim", 37.1, -122.1));
        agg.ingest_remote(remote_update("sam", 37.2, -122.2));
        agg.ingest_local(&sample_at(37.0, -122.0));

        let view = agg.members();
        assert_eq!(ids(&view), vec!["me", "sam", "kim"]);
        assert_eq!(view[0].user_name, "Alex");
        assert_eq!(view[0].circle_id, "family");
    }

    #[test]
    fn remote_echo_of_local_user_is_filtered() {
        let agg = CircleLocationAggregator::new("me", "Alex");
        agg.set_membership_roster(roster());
        agg.ingest_local(&sample_at(37.0, -122.0));

        assert!(!agg.ingest_remote(remote_update("me", 10.0, 10.0)));

        let view = agg.members();
        let locals: Vec<_> = view.iter().filter(|m| m.user_id == "me").collect();
        assert_eq!(locals.len(), 1);
        assert_eq!(locals[0].latitude, 37.0);
    }

    #[test]
    fn unknown_users_do_not_become_ghosts() {
        let agg = CircleLocationAggregator::new("me", "Alex");
        agg.set_membership_roster(roster());

        assert!(!agg.ingest_remote(remote_update("stranger", 1.0, 1.0)));
        assert!(agg.members().is_empty());
    }

    #[test]
    fn last_write_wins_by_arrival() {
        let agg = CircleLocationAggregator::new("me", "Alex");
        agg.set_membership_roster(roster());

        let newer = remote_update("sam", 37.5, -122.5);
        let mut older = remote_update("sam", 37.6, -122.6);
        older.captured_at = newer.captured_at - chrono::Duration::minutes(5);

        agg.ingest_remote(newer);
        agg.ingest_remote(older);
        assert_eq!(agg.members()[0].latitude, 37.6);
    }

    #[test]
    fn roster_switch_prunes_departed_members() {
        let agg = CircleLocationAggregator::new("me", "Alex");
        agg.set_membership_roster(roster());
        agg.ingest_remote(remote_update("sam", 37.2, -122.2));
        agg.ingest_remote(remote_update("kim", 37.1, -122.1));

        agg.set_membership_roster(vec![
            RosterMember::new("me", "Alex", "work"),
            RosterMember::new("kim", "Kimberly", "work"),
        ]);
        let view = agg.members();
        assert_eq!(ids(&view), vec!["kim"]);
        assert_eq!(view[0].user_name, "Kimberly");
        assert_eq!(view[0].circle_id, "work");
        assert_eq!(view[0].latitude, 37.1);

        // Sam is gone from the roster, so a late update is ignored.
        assert!(!agg.ingest_remote(remote_update("sam", 37.3, -122.3)));
    }

    #[test]
    fn local_entry_requires_roster_membership() {
        let agg = CircleLocationAggregator::new("me", "Alex");
        agg.ingest_local(&sample_at(37.0, -122.0));
        assert!(agg.members().is_empty());

        agg.set_membership_roster(vec![
            RosterMember::new("sam", "Sam", "family"),
            RosterMember::new("kim", "Kim", "family"),
        ]);
        agg.ingest_remote(remote_update("sam", 37.2, -122.2));
        agg.ingest_remote(remote_update("kim", 37.1, -122.1));
        assert_eq!(ids(&agg.members()), vec!["sam", "kim"]);

        // Joining the roster brings the cached local sample back.
        agg.set_membership_roster(roster());
        assert_eq!(ids(&agg.members()), vec!["me", "sam", "kim"]);
    }

    #[test]
    fn presence_toggles_online_flag() {
        let agg = CircleLocationAggregator::new("me", "Alex");
        agg.set_membership_roster(roster());
        agg.ingest_remote(remote_update("sam", 37.2, -122.2));

        assert!(agg.set_presence("sam", false));
        assert!(!agg.set_presence("sam", false));
        assert!(!agg.members()[0].is_online);

        // The next location update brings them back online.
        agg.ingest_remote(remote_update("sam", 37.2, -122.2));
        assert!(agg.members()[0].is_online);
    }

    #[test]
    fn invalid_remote_coordinates_are_dropped() {
        let agg = CircleLocationAggregator::new("me", "Alex");
        agg.set_membership_roster(roster());
        assert!(!agg.ingest_remote(remote_update("sam", 123.0, 0.0)));
        assert!(agg.members().is_empty());
    }

    #[test]
    fn subscribe_delivers_current_view_immediately() {
        let agg = CircleLocationAggregator::new("me", "Alex");
        agg.set_membership_roster(roster());
        agg.ingest_local(&sample_at(37.0, -122.0));

        let views = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let views = views.clone();
            agg.subscribe(move |view| views.lock().unwrap().push(view.len()))
        };
        assert_eq!(*views.lock().unwrap(), vec![1]);

        agg.ingest_remote(remote_update("sam", 37.2, -122.2));
        assert_eq!(*views.lock().unwrap(), vec![1, 2]);

        sub.unsubscribe();
        agg.ingest_remote(remote_update("kim", 37.1, -122.1));
        assert_eq!(*views.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn ignored_updates_do_not_notify() {
        let agg = CircleLocationAggregator::new("me", "Alex");
        agg.set_membership_roster(roster());

        let calls = Arc::new(AtomicU64::new(0));
        let _sub = {
            let calls = calls.clone();
            agg.subscribe(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        agg.ingest_remote(remote_update("stranger", 1.0, 1.0));
        agg.ingest_remote(remote_update("me", 1.0, 1.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
