//! The closed set of collections mirrored by the snapshot store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One backing table tracked by the snapshot.
///
/// Serialized in `snake_case`, which is also the backend table name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Application user profiles.
    Users,
    /// League events (tournaments, fixtures).
    Events,
    /// Real-world cricket teams.
    Teams,
    /// Players and their per-match points.
    Players,
    /// Fantasy teams picked by participants.
    ParticipantTeams,
    /// Player replacement requests awaiting review.
    ReplacementRequests,
    /// Admin announcements, newest first.
    Announcements,
    /// League chat, oldest first.
    ChatMessages,
    /// Past season results, by season.
    CnflHistory,
    /// The singleton settings row.
    SiteSettings,
}

/// Sort applied by the backend when reading a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    /// Column to order by.
    pub column: &'static str,
    /// `true` for ascending, `false` for descending.
    pub ascending: bool,
}

impl Collection {
    /// Every collection, in load order.
    pub const ALL: [Self; 10] = [
        Self::Users,
        Self::Events,
        Self::Teams,
        Self::Players,
        Self::ParticipantTeams,
        Self::ReplacementRequests,
        Self::Announcements,
        Self::ChatMessages,
        Self::CnflHistory,
        Self::SiteSettings,
    ];

    /// Backend table name.
    #[must_use]
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Events => "events",
            Self::Teams => "teams",
            Self::Players => "players",
            Self::ParticipantTeams => "participant_teams",
            Self::ReplacementRequests => "replacement_requests",
            Self::Announcements => "announcements",
            Self::ChatMessages => "chat_messages",
            Self::CnflHistory => "cnfl_history",
            Self::SiteSettings => "site_settings",
        }
    }

    /// Resolves a backend table name.
    #[must_use]
    pub fn from_table_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.table_name() == name)
    }

    /// Order the initial load requests for this collection, if any.
    #[must_use]
    pub const fn load_order(self) -> Option<OrderBy> {
        match self {
            Self::Announcements => Some(OrderBy {
                column: "timestamp",
                ascending: false,
            }),
            Self::ChatMessages => Some(OrderBy {
                column: "timestamp",
                ascending: true,
            }),
            Self::CnflHistory => Some(OrderBy {
                column: "season_number",
                ascending: true,
            }),
            _ => None,
        }
    }

    /// Returns `true` for the collection holding a single row.
    #[must_use]
    pub const fn is_singleton(self) -> bool {
        matches!(self, Self::SiteSettings)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Error returned when a string names no known collection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown collection: {0}")]
pub struct UnknownCollection(pub String);

impl FromStr for Collection {
    type Err = UnknownCollection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_table_name(s).ok_or_else(|| UnknownCollection(s.to_string()))
    }
}
