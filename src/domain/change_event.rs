//! Row-level change notifications.
//!
//! Gateways deliver untyped [`RawChange`]s in commit order. The store
//! decodes each into a typed [`ChangeEvent`] before reconciling it, and
//! announces the result as an [`AppliedChange`] through the
//! [`super::EventBus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::records::{
    Announcement, ChatMessage, CnflHistory, LeagueEvent, ParticipantTeam, Player, Record,
    ReplacementRequest, SiteSettings, Team, UserProfile,
};
use super::{Collection, RecordId};
use crate::error::StoreError;

/// Kind of row operation committed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

/// Change notification as emitted by a gateway.
///
/// Mirrors the `postgres_changes` payload:
/// `{"table": "...", "type": "INSERT", "record": {...}, "old_record": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    /// Backend table name.
    pub table: String,
    /// Operation kind.
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Row after the change (INSERT / UPDATE).
    #[serde(default)]
    pub record: Option<Value>,
    /// Row before the change; for DELETE at least the primary key.
    #[serde(default)]
    pub old_record: Option<Value>,
}

impl RawChange {
    /// Builds a change for a typed collection.
    #[must_use]
    pub fn new(
        collection: Collection,
        kind: ChangeKind,
        record: Option<Value>,
        old_record: Option<Value>,
    ) -> Self {
        Self {
            table: collection.table_name().to_string(),
            kind,
            record,
            old_record,
        }
    }
}

/// Typed change to one keyed collection.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange<T> {
    /// Append unless a row with the same id exists.
    Insert(T),
    /// Replace the row with the same id, appending if missing.
    Update(T),
    /// Remove the row with this id, if present.
    Delete(RecordId),
}

impl<T: Record> RowChange<T> {
    /// Id of the affected row.
    #[must_use]
    pub fn id(&self) -> &RecordId {
        match self {
            Self::Insert(row) | Self::Update(row) => row.id(),
            Self::Delete(id) => id,
        }
    }

    /// Operation kind.
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete(_) => ChangeKind::Delete,
        }
    }

    fn decode(raw: RawChange) -> Result<Self, StoreError> {
        match raw.kind {
            ChangeKind::Insert => Ok(Self::Insert(decode_row(
                T::COLLECTION,
                raw.kind,
                raw.record,
            )?)),
            ChangeKind::Update => Ok(Self::Update(decode_row(
                T::COLLECTION,
                raw.kind,
                raw.record,
            )?)),
            ChangeKind::Delete => {
                let id = raw
                    .old_record
                    .as_ref()
                    .and_then(|old| old.get("id"))
                    .cloned()
                    .ok_or(StoreError::MissingRecord {
                        collection: T::COLLECTION,
                        kind: ChangeKind::Delete,
                    })?;
                let id = serde_json::from_value(id).map_err(|source| StoreError::Decode {
                    collection: T::COLLECTION,
                    source,
                })?;
                Ok(Self::Delete(id))
            }
        }
    }
}

/// Typed change to the settings singleton.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsChange {
    /// The row was inserted or updated; replace the singleton wholesale.
    Replace {
        /// `Insert` or `Update`, as reported by the backend.
        kind: ChangeKind,
        /// The new singleton.
        settings: SiteSettings,
    },
    /// The row was deleted; the local singleton is left untouched.
    Removed,
}

/// A decoded change, tagged by collection.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// Change to [`Collection::Users`].
    Users(RowChange<UserProfile>),
    /// Change to [`Collection::Events`].
    Events(RowChange<LeagueEvent>),
    /// Change to [`Collection::Teams`].
    Teams(RowChange<Team>),
    /// Change to [`Collection::Players`].
    Players(RowChange<Player>),
    /// Change to [`Collection::ParticipantTeams`].
    ParticipantTeams(RowChange<ParticipantTeam>),
    /// Change to [`Collection::ReplacementRequests`].
    ReplacementRequests(RowChange<ReplacementRequest>),
    /// Change to [`Collection::Announcements`].
    Announcements(RowChange<Announcement>),
    /// Change to [`Collection::ChatMessages`].
    ChatMessages(RowChange<ChatMessage>),
    /// Change to [`Collection::CnflHistory`].
    CnflHistory(RowChange<CnflHistory>),
    /// Change to [`Collection::SiteSettings`].
    SiteSettings(SettingsChange),
}

impl ChangeEvent {
    /// Decodes a gateway notification into a typed event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownCollection`] for tables the store does
    /// not mirror, [`StoreError::MissingRecord`] when the payload lacks the
    /// row the operation needs, and [`StoreError::Decode`] when the row does
    /// not match the collection's shape.
    pub fn decode(raw: RawChange) -> Result<Self, StoreError> {
        let Some(collection) = Collection::from_table_name(&raw.table) else {
            return Err(StoreError::UnknownCollection(raw.table));
        };
        Ok(match collection {
            Collection::Users => Self::Users(RowChange::decode(raw)?),
            Collection::Events => Self::Events(RowChange::decode(raw)?),
            Collection::Teams => Self::Teams(RowChange::decode(raw)?),
            Collection::Players => Self::Players(RowChange::decode(raw)?),
            Collection::ParticipantTeams => Self::ParticipantTeams(RowChange::decode(raw)?),
            Collection::ReplacementRequests => {
                Self::ReplacementRequests(RowChange::decode(raw)?)
            }
            Collection::Announcements => Self::Announcements(RowChange::decode(raw)?),
            Collection::ChatMessages => Self::ChatMessages(RowChange::decode(raw)?),
            Collection::CnflHistory => Self::CnflHistory(RowChange::decode(raw)?),
            Collection::SiteSettings => Self::SiteSettings(match raw.kind {
                ChangeKind::Delete => SettingsChange::Removed,
                kind @ (ChangeKind::Insert | ChangeKind::Update) => SettingsChange::Replace {
                    kind,
                    settings: decode_row(Collection::SiteSettings, kind, raw.record)?,
                },
            }),
        })
    }

    /// Collection the event applies to.
    #[must_use]
    pub const fn collection(&self) -> Collection {
        match self {
            Self::Users(_) => Collection::Users,
            Self::Events(_) => Collection::Events,
            Self::Teams(_) => Collection::Teams,
            Self::Players(_) => Collection::Players,
            Self::ParticipantTeams(_) => Collection::ParticipantTeams,
            Self::ReplacementRequests(_) => Collection::ReplacementRequests,
            Self::Announcements(_) => Collection::Announcements,
            Self::ChatMessages(_) => Collection::ChatMessages,
            Self::CnflHistory(_) => Collection::CnflHistory,
            Self::SiteSettings(_) => Collection::SiteSettings,
        }
    }

    /// Operation kind.
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match self {
            Self::Users(c) => c.kind(),
            Self::Events(c) => c.kind(),
            Self::Teams(c) => c.kind(),
            Self::Players(c) => c.kind(),
            Self::ParticipantTeams(c) => c.kind(),
            Self::ReplacementRequests(c) => c.kind(),
            Self::Announcements(c) => c.kind(),
            Self::ChatMessages(c) => c.kind(),
            Self::CnflHistory(c) => c.kind(),
            Self::SiteSettings(SettingsChange::Replace { kind, .. }) => *kind,
            Self::SiteSettings(SettingsChange::Removed) => ChangeKind::Delete,
        }
    }

    /// Id of the affected row; `None` for the settings singleton.
    #[must_use]
    pub fn id(&self) -> Option<&RecordId> {
        match self {
            Self::Users(c) => Some(c.id()),
            Self::Events(c) => Some(c.id()),
            Self::Teams(c) => Some(c.id()),
            Self::Players(c) => Some(c.id()),
            Self::ParticipantTeams(c) => Some(c.id()),
            Self::ReplacementRequests(c) => Some(c.id()),
            Self::Announcements(c) => Some(c.id()),
            Self::ChatMessages(c) => Some(c.id()),
            Self::CnflHistory(c) => Some(c.id()),
            Self::SiteSettings(_) => None,
        }
    }
}

/// Notification that a change has been reconciled into the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedChange {
    /// Collection that changed.
    pub collection: Collection,
    /// Operation kind.
    pub kind: ChangeKind,
    /// Affected row; absent for the settings singleton.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// When the change was applied locally.
    pub timestamp: DateTime<Utc>,
}

impl From<&ChangeEvent> for AppliedChange {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            collection: event.collection(),
            kind: event.kind(),
            id: event.id().cloned(),
            timestamp: Utc::now(),
        }
    }
}

fn decode_row<T: serde::de::DeserializeOwned>(
    collection: Collection,
    kind: ChangeKind,
    record: Option<Value>,
) -> Result<T, StoreError> {
    let record = record.ok_or(StoreError::MissingRecord { collection, kind })?;
    serde_json::from_value(record).map_err(|source| StoreError::Decode { collection, source })
}
