//! Typed row shapes for every mirrored collection.
//!
//! Fields the core does not interpret are kept in a flattened `extra` map so
//! that a round trip through the store never drops columns it does not know
//! about.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Collection, RecordId};

/// A row of a keyed collection.
///
/// Implemented by every entity except [`SiteSettings`], which is a
/// singleton without a stable key.
pub trait Record:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Collection the row belongs to.
    const COLLECTION: Collection;

    /// Primary key of the row.
    fn id(&self) -> &RecordId;

    /// Restores the display order of a collection after a mutation.
    ///
    /// Unordered collections keep arrival order.
    fn arrange(_rows: &mut [Self]) {}
}

/// Authorization role of a profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// League administrator.
    Admin,
    /// Regular league participant.
    #[default]
    Participant,
}

/// Application-level user record, keyed by the auth identity id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Same id as the authentication identity.
    #[serde(default, skip_serializing_if = "RecordId::is_unassigned")]
    pub id: RecordId,
    /// Login email.
    pub email: String,
    /// Display name.
    pub full_name: String,
    /// Authorization role.
    #[serde(default)]
    pub role: Role,
    /// Facebook profile link given at registration.
    #[serde(default)]
    pub fb_link: Option<String>,
    /// Columns not interpreted by the core.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    /// Returns `true` if the profile may use admin actions.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl Record for UserProfile {
    const COLLECTION: Collection = Collection::Users;

    fn id(&self) -> &RecordId {
        &self.id
    }
}

/// A league event (tournament or fixture window).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeagueEvent {
    /// Primary key.
    #[serde(default, skip_serializing_if = "RecordId::is_unassigned")]
    pub id: RecordId,
    /// Event name.
    #[serde(default)]
    pub name: String,
    /// Columns not interpreted by the core.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record for LeagueEvent {
    const COLLECTION: Collection = Collection::Events;

    fn id(&self) -> &RecordId {
        &self.id
    }
}

/// A real-world cricket team.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Team {
    /// Primary key.
    #[serde(default, skip_serializing_if = "RecordId::is_unassigned")]
    pub id: RecordId,
    /// Team name.
    pub name: String,
    /// Columns not interpreted by the core.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record for Team {
    const COLLECTION: Collection = Collection::Teams;

    fn id(&self) -> &RecordId {
        &self.id
    }
}

/// A player with one points entry per scored match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Player {
    /// Primary key.
    #[serde(default, skip_serializing_if = "RecordId::is_unassigned")]
    pub id: RecordId,
    /// Player name.
    #[serde(default)]
    pub name: String,
    /// Owning team.
    #[serde(default)]
    pub team_id: Option<RecordId>,
    /// Points per match, in match order.
    ///
    /// Whole numbers only (`BIGINT[]` in the bundled schema). A backend
    /// storing fractional points would fail to decode, and during the
    /// initial load that fails the whole load.
    #[serde(default)]
    pub points: Vec<i64>,
    /// Columns not interpreted by the core.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Player {
    /// Sum of all recorded points.
    #[must_use]
    pub fn total_points(&self) -> i64 {
        self.points.iter().sum()
    }
}

impl Record for Player {
    const COLLECTION: Collection = Collection::Players;

    fn id(&self) -> &RecordId {
        &self.id
    }
}

/// A fantasy team owned by a participant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantTeam {
    /// Primary key.
    #[serde(default, skip_serializing_if = "RecordId::is_unassigned")]
    pub id: RecordId,
    /// Owning profile.
    #[serde(default)]
    pub user_id: Option<RecordId>,
    /// Selected players.
    #[serde(default)]
    pub player_ids: Vec<RecordId>,
    /// Columns not interpreted by the core.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record for ParticipantTeam {
    const COLLECTION: Collection = Collection::ParticipantTeams;

    fn id(&self) -> &RecordId {
        &self.id
    }
}

/// Review state of a [`ReplacementRequest`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementStatus {
    /// Awaiting an admin decision.
    #[default]
    Pending,
    /// Accepted; the swap is applied to the participant team.
    Approved,
    /// Declined.
    Rejected,
}

/// A participant's request to swap one player for another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplacementRequest {
    /// Primary key.
    #[serde(default, skip_serializing_if = "RecordId::is_unassigned")]
    pub id: RecordId,
    /// Requesting profile.
    #[serde(default)]
    pub user_id: Option<RecordId>,
    /// Review state, mutated in place.
    #[serde(default)]
    pub status: ReplacementStatus,
    /// Columns not interpreted by the core.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record for ReplacementRequest {
    const COLLECTION: Collection = Collection::ReplacementRequests;

    fn id(&self) -> &RecordId {
        &self.id
    }
}

/// An admin announcement. Displayed newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    /// Primary key.
    #[serde(default, skip_serializing_if = "RecordId::is_unassigned")]
    pub id: RecordId,
    /// Announcement body.
    #[serde(default)]
    pub content: String,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
    /// Columns not interpreted by the core.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record for Announcement {
    const COLLECTION: Collection = Collection::Announcements;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn arrange(rows: &mut [Self]) {
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }
}

/// A chat line. Displayed oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Primary key.
    #[serde(default, skip_serializing_if = "RecordId::is_unassigned")]
    pub id: RecordId,
    /// Author profile.
    #[serde(default)]
    pub user_id: Option<RecordId>,
    /// Message text.
    #[serde(default)]
    pub content: String,
    /// Send time.
    pub timestamp: DateTime<Utc>,
    /// Columns not interpreted by the core.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record for ChatMessage {
    const COLLECTION: Collection = Collection::ChatMessages;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn arrange(rows: &mut [Self]) {
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }
}

/// Result of a past season.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CnflHistory {
    /// Primary key.
    #[serde(default, skip_serializing_if = "RecordId::is_unassigned")]
    pub id: RecordId,
    /// Season label, compared as text (`"10"` sorts before `"9"`).
    pub season_number: String,
    /// Columns not interpreted by the core.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record for CnflHistory {
    const COLLECTION: Collection = Collection::CnflHistory;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn arrange(rows: &mut [Self]) {
        rows.sort_by(|a, b| a.season_number.cmp(&b.season_number));
    }
}

/// League-wide settings, stored as a single row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteSettings {
    /// Row key, if the backend assigned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Whether new registrations are accepted.
    #[serde(default)]
    pub registration_open: bool,
    /// Whether participants may submit replacement requests.
    #[serde(default)]
    pub replacements_open: bool,
    /// Columns not interpreted by the core.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        let Some(ts) = Utc.timestamp_opt(secs, 0).single() else {
            panic!("valid timestamp");
        };
        ts
    }

    #[test]
    fn points_are_whole_numbers() {
        let whole = serde_json::json!({"id": "p1", "name": "Pathum", "points": [12, 0, 45]});
        let Ok(player) = serde_json::from_value::<Player>(whole) else {
            panic!("integer points should decode");
        };
        assert_eq!(player.total_points(), 57);

        let fractional = serde_json::json!({"id": "p1", "name": "Pathum", "points": [12.5]});
        assert!(serde_json::from_value::<Player>(fractional).is_err());
    }

    #[test]
    fn unknown_columns_survive_a_round_trip() {
        let json = serde_json::json!({
            "id": "t1",
            "name": "Kandy Falcons",
            "logo_url": "https://example.org/kf.png"
        });
        let Ok(team) = serde_json::from_value::<Team>(json.clone()) else {
            panic!("team should decode");
        };
        assert_eq!(team.extra.get("logo_url"), json.get("logo_url"));
        let Ok(back) = serde_json::to_value(&team) else {
            panic!("team should encode");
        };
        assert_eq!(back, json);
    }

    #[test]
    fn unassigned_id_is_omitted_on_write() {
        let team = Team {
            id: RecordId::unassigned(),
            name: "Galle Marvels".to_string(),
            extra: Map::new(),
        };
        let Ok(value) = serde_json::to_value(&team) else {
            panic!("team should encode");
        };
        assert!(value.get("id").is_none());
    }

    #[test]
    fn role_uses_upper_case_wire_names() {
        let Ok(role) = serde_json::from_str::<Role>("\"ADMIN\"") else {
            panic!("role should decode");
        };
        assert_eq!(role, Role::Admin);
        assert_eq!(Role::default(), Role::Participant);
    }

    #[test]
    fn announcements_arrange_newest_first() {
        let mut rows = vec![
            Announcement {
                id: "a0".into(),
                content: String::new(),
                timestamp: at(10),
                extra: Map::new(),
            },
            Announcement {
                id: "a1".into(),
                content: String::new(),
                timestamp: at(20),
                extra: Map::new(),
            },
        ];
        Announcement::arrange(&mut rows);
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a1", "a0"]);
    }

    #[test]
    fn history_orders_seasons_as_text() {
        let mut rows: Vec<CnflHistory> = ["9", "10", "2"]
            .into_iter()
            .map(|season| CnflHistory {
                id: RecordId::generate(),
                season_number: season.to_string(),
                extra: Map::new(),
            })
            .collect();
        CnflHistory::arrange(&mut rows);
        let seasons: Vec<_> = rows.iter().map(|r| r.season_number.as_str()).collect();
        assert_eq!(seasons, ["10", "2", "9"]);
    }

    #[test]
    fn player_total_sums_points() {
        let player = Player {
            id: "p1".into(),
            name: "Wanindu".to_string(),
            team_id: None,
            points: vec![10, 20, -5],
            extra: Map::new(),
        };
        assert_eq!(player.total_points(), 25);
    }
}
