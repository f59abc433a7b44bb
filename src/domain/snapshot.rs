//! Immutable snapshot of every mirrored collection and the reconciliation
//! step that derives the next snapshot from a change.
//!
//! Each collection sits behind its own `Arc`, so producing the next
//! snapshot clones only the collection a change touches. Readers holding an
//! older snapshot keep a consistent view.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::change_event::{ChangeEvent, RowChange, SettingsChange};
use super::records::{
    Announcement, ChatMessage, CnflHistory, LeagueEvent, ParticipantTeam, Player, Record,
    ReplacementRequest, SiteSettings, Team, UserProfile,
};
use super::{Collection, RecordId};

/// Complete in-memory copy of all tracked collections at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    /// User profiles.
    pub users: Arc<Vec<UserProfile>>,
    /// League events.
    pub events: Arc<Vec<LeagueEvent>>,
    /// Cricket teams.
    pub teams: Arc<Vec<Team>>,
    /// Players.
    pub players: Arc<Vec<Player>>,
    /// Participant fantasy teams.
    pub participant_teams: Arc<Vec<ParticipantTeam>>,
    /// Replacement requests.
    pub replacement_requests: Arc<Vec<ReplacementRequest>>,
    /// Announcements, newest first.
    pub announcements: Arc<Vec<Announcement>>,
    /// Chat messages, oldest first.
    pub chat_messages: Arc<Vec<ChatMessage>>,
    /// Season history, by season label.
    pub cnfl_history: Arc<Vec<CnflHistory>>,
    /// Settings singleton.
    pub site_settings: Arc<SiteSettings>,
}

impl Snapshot {
    /// Returns the snapshot that results from applying `event`.
    ///
    /// Only the affected collection is rebuilt; every other collection is
    /// shared with `self`.
    #[must_use]
    pub fn apply(&self, event: &ChangeEvent) -> Self {
        let mut next = self.clone();
        match event {
            ChangeEvent::Users(change) => next.users = reconcile(&self.users, change),
            ChangeEvent::Events(change) => next.events = reconcile(&self.events, change),
            ChangeEvent::Teams(change) => next.teams = reconcile(&self.teams, change),
            ChangeEvent::Players(change) => next.players = reconcile(&self.players, change),
            ChangeEvent::ParticipantTeams(change) => {
                next.participant_teams = reconcile(&self.participant_teams, change);
            }
            ChangeEvent::ReplacementRequests(change) => {
                next.replacement_requests = reconcile(&self.replacement_requests, change);
            }
            ChangeEvent::Announcements(change) => {
                next.announcements = reconcile(&self.announcements, change);
            }
            ChangeEvent::ChatMessages(change) => {
                next.chat_messages = reconcile(&self.chat_messages, change);
            }
            ChangeEvent::CnflHistory(change) => {
                next.cnfl_history = reconcile(&self.cnfl_history, change);
            }
            ChangeEvent::SiteSettings(SettingsChange::Replace { settings, .. }) => {
                next.site_settings = Arc::new(settings.clone());
            }
            ChangeEvent::SiteSettings(SettingsChange::Removed) => {}
        }
        next
    }

    /// Number of rows held for `collection` (always 1 for the singleton).
    #[must_use]
    pub fn len_of(&self, collection: Collection) -> usize {
        match collection {
            Collection::Users => self.users.len(),
            Collection::Events => self.events.len(),
            Collection::Teams => self.teams.len(),
            Collection::Players => self.players.len(),
            Collection::ParticipantTeams => self.participant_teams.len(),
            Collection::ReplacementRequests => self.replacement_requests.len(),
            Collection::Announcements => self.announcements.len(),
            Collection::ChatMessages => self.chat_messages.len(),
            Collection::CnflHistory => self.cnfl_history.len(),
            Collection::SiteSettings => 1,
        }
    }

    /// Serializes one collection as JSON.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if a row fails to serialize.
    pub fn collection_json(&self, collection: Collection) -> Result<Value, serde_json::Error> {
        match collection {
            Collection::Users => serde_json::to_value(&*self.users),
            Collection::Events => serde_json::to_value(&*self.events),
            Collection::Teams => serde_json::to_value(&*self.teams),
            Collection::Players => serde_json::to_value(&*self.players),
            Collection::ParticipantTeams => serde_json::to_value(&*self.participant_teams),
            Collection::ReplacementRequests => serde_json::to_value(&*self.replacement_requests),
            Collection::Announcements => serde_json::to_value(&*self.announcements),
            Collection::ChatMessages => serde_json::to_value(&*self.chat_messages),
            Collection::CnflHistory => serde_json::to_value(&*self.cnfl_history),
            Collection::SiteSettings => serde_json::to_value(&*self.site_settings),
        }
    }

    /// Looks up a player by id.
    #[must_use]
    pub fn player(&self, id: &RecordId) -> Option<&Player> {
        self.players.iter().find(|p| &p.id == id)
    }

    /// Looks up a profile by id.
    #[must_use]
    pub fn user(&self, id: &RecordId) -> Option<&UserProfile> {
        self.users.iter().find(|u| &u.id == id)
    }
}

/// Applies one keyed change to a collection, returning the new collection.
///
/// INSERT appends only when the id is new, UPDATE replaces or appends,
/// DELETE removes if present. Ordered collections are re-arranged.
fn reconcile<T: Record>(rows: &Arc<Vec<T>>, change: &RowChange<T>) -> Arc<Vec<T>> {
    let mut next: Vec<T> = rows.as_ref().clone();
    match change {
        RowChange::Insert(row) => {
            if next.iter().any(|existing| existing.id() == row.id()) {
                return Arc::clone(rows);
            }
            next.push(row.clone());
        }
        RowChange::Update(row) => match next.iter_mut().find(|existing| existing.id() == row.id())
        {
            Some(slot) => *slot = row.clone(),
            None => next.push(row.clone()),
        },
        RowChange::Delete(id) => {
            let before = next.len();
            next.retain(|existing| existing.id() != id);
            if next.len() == before {
                return Arc::clone(rows);
            }
        }
    }
    T::arrange(&mut next);
    Arc::new(next)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::HashSet;

    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::Map;

    use super::*;
    use crate::domain::ChangeKind;

    fn at(secs: i64) -> DateTime<Utc> {
        let Some(ts) = Utc.timestamp_opt(secs, 0).single() else {
            panic!("valid timestamp");
        };
        ts
    }

    fn player(id: &str, points: Vec<i64>) -> Player {
        Player {
            id: id.into(),
            name: format!("player {id}"),
            team_id: None,
            points,
            extra: Map::new(),
        }
    }

    fn announcement(id: &str, secs: i64) -> Announcement {
        Announcement {
            id: id.into(),
            content: String::new(),
            timestamp: at(secs),
            extra: Map::new(),
        }
    }

    fn chat(id: &str, secs: i64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            user_id: None,
            content: String::new(),
            timestamp: at(secs),
            extra: Map::new(),
        }
    }

    fn season(id: &str, label: &str) -> CnflHistory {
        CnflHistory {
            id: id.into(),
            season_number: label.to_string(),
            extra: Map::new(),
        }
    }

    fn apply_all(start: Snapshot, events: &[ChangeEvent]) -> Snapshot {
        events.iter().fold(start, |snap, event| snap.apply(event))
    }

    #[test]
    fn update_after_load_replaces_points() {
        let loaded = Snapshot {
            players: Arc::new(vec![player("p1", vec![])]),
            ..Snapshot::default()
        };
        let next = loaded.apply(&ChangeEvent::Players(RowChange::Update(player(
            "p1",
            vec![10, 20],
        ))));
        assert_eq!(next.players.len(), 1);
        let Some(p1) = next.player(&"p1".into()) else {
            panic!("p1 should be present");
        };
        assert_eq!(p1.points, vec![10, 20]);
    }

    #[test]
    fn insert_is_idempotent() {
        let insert = ChangeEvent::Players(RowChange::Insert(player("p1", vec![1])));
        let once = Snapshot::default().apply(&insert);
        let twice = once.apply(&insert);
        assert_eq!(once, twice);
        assert_eq!(twice.players.len(), 1);
    }

    #[test]
    fn insert_does_not_overwrite_existing_row() {
        let loaded = Snapshot {
            players: Arc::new(vec![player("p1", vec![7])]),
            ..Snapshot::default()
        };
        let next = loaded.apply(&ChangeEvent::Players(RowChange::Insert(player("p1", vec![]))));
        assert_eq!(next.players.as_slice(), &[player("p1", vec![7])]);
    }

    #[test]
    fn update_of_unknown_row_appends() {
        let next = Snapshot::default().apply(&ChangeEvent::Teams(RowChange::Update(Team {
            id: "t1".into(),
            name: "Dambulla".to_string(),
            extra: Map::new(),
        })));
        assert_eq!(next.teams.len(), 1);
    }

    #[test]
    fn delete_of_absent_id_is_noop() {
        let loaded = Snapshot {
            players: Arc::new(vec![player("p1", vec![])]),
            ..Snapshot::default()
        };
        let next = loaded.apply(&ChangeEvent::Players(RowChange::Delete("ghost".into())));
        assert_eq!(next.players.len(), 1);
        assert!(Arc::ptr_eq(&loaded.players, &next.players));
    }

    #[test]
    fn untouched_collections_are_shared() {
        let loaded = Snapshot::default();
        let next = loaded.apply(&ChangeEvent::Players(RowChange::Insert(player("p1", vec![]))));
        assert!(Arc::ptr_eq(&loaded.teams, &next.teams));
        assert!(!Arc::ptr_eq(&loaded.players, &next.players));
    }

    #[test]
    fn new_announcement_lands_first() {
        let loaded = Snapshot {
            announcements: Arc::new(vec![announcement("a0", 100)]),
            ..Snapshot::default()
        };
        let next = loaded.apply(&ChangeEvent::Announcements(RowChange::Insert(
            announcement("a1", 200),
        )));
        let ids: Vec<_> = next.announcements.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["a1", "a0"]);
    }

    #[test]
    fn ordering_invariants_hold_after_mixed_mutations() {
        let events = vec![
            ChangeEvent::Announcements(RowChange::Insert(announcement("a1", 50))),
            ChangeEvent::Announcements(RowChange::Insert(announcement("a2", 300))),
            ChangeEvent::Announcements(RowChange::Update(announcement("a1", 500))),
            ChangeEvent::Announcements(RowChange::Insert(announcement("a3", 10))),
            ChangeEvent::ChatMessages(RowChange::Insert(chat("c1", 30))),
            ChangeEvent::ChatMessages(RowChange::Insert(chat("c2", 5))),
            ChangeEvent::ChatMessages(RowChange::Update(chat("c2", 60))),
            ChangeEvent::ChatMessages(RowChange::Insert(chat("c3", 1))),
            ChangeEvent::CnflHistory(RowChange::Insert(season("h1", "3"))),
            ChangeEvent::CnflHistory(RowChange::Insert(season("h2", "12"))),
            ChangeEvent::CnflHistory(RowChange::Update(season("h3", "1"))),
            ChangeEvent::CnflHistory(RowChange::Delete("h2".into())),
        ];
        let snap = apply_all(Snapshot::default(), &events);

        assert!(
            snap.announcements
                .windows(2)
                .all(|w| matches!(w, [a, b] if a.timestamp >= b.timestamp))
        );
        assert!(
            snap.chat_messages
                .windows(2)
                .all(|w| matches!(w, [a, b] if a.timestamp <= b.timestamp))
        );
        assert!(
            snap.cnfl_history
                .windows(2)
                .all(|w| matches!(w, [a, b] if a.season_number <= b.season_number))
        );
        assert_eq!(snap.announcements.len(), 3);
        assert_eq!(snap.chat_messages.len(), 3);
        assert_eq!(snap.cnfl_history.len(), 2);
    }

    #[test]
    fn one_row_per_surviving_id() {
        let events = vec![
            ChangeEvent::Players(RowChange::Insert(player("p1", vec![]))),
            ChangeEvent::Players(RowChange::Update(player("p2", vec![3]))),
            ChangeEvent::Players(RowChange::Insert(player("p1", vec![9]))),
            ChangeEvent::Players(RowChange::Insert(player("p3", vec![]))),
            ChangeEvent::Players(RowChange::Update(player("p1", vec![4]))),
            ChangeEvent::Players(RowChange::Delete("p3".into())),
            ChangeEvent::Players(RowChange::Insert(player("p2", vec![]))),
        ];
        let snap = apply_all(Snapshot::default(), &events);

        let ids: HashSet<_> = snap.players.iter().map(|p| p.id.clone()).collect();
        assert_eq!(snap.players.len(), ids.len());
        assert_eq!(
            ids,
            HashSet::from([RecordId::from("p1"), RecordId::from("p2")])
        );
        let Some(p1) = snap.player(&"p1".into()) else {
            panic!("p1 should survive");
        };
        assert_eq!(p1.points, vec![4]);
    }

    #[test]
    fn settings_replace_wholesale_and_ignore_delete() {
        let settings = SiteSettings {
            id: Some("1".into()),
            registration_open: true,
            replacements_open: false,
            extra: Map::new(),
        };
        let snap = Snapshot::default()
            .apply(&ChangeEvent::SiteSettings(SettingsChange::Replace {
                kind: ChangeKind::Update,
                settings: settings.clone(),
            }))
            .apply(&ChangeEvent::SiteSettings(SettingsChange::Removed));
        assert_eq!(*snap.site_settings, settings);
    }

    #[test]
    fn collection_json_lists_rows() {
        let snap = Snapshot {
            players: Arc::new(vec![player("p1", vec![1, 2])]),
            ..Snapshot::default()
        };
        let Ok(json) = snap.collection_json(Collection::Players) else {
            panic!("players should encode");
        };
        assert_eq!(json.as_array().map(Vec::len), Some(1));
        assert_eq!(snap.len_of(Collection::SiteSettings), 1);
    }
}
