//! Domain layer: row identity, typed records, change events, and the
//! snapshot reconciliation step.
//!
//! Everything here is synchronous and backend-agnostic; the service layer
//! drives it from the gateway's change stream.

pub mod change_event;
pub mod collection;
pub mod event_bus;
pub mod record_id;
pub mod records;
pub mod snapshot;

pub use change_event::{
    AppliedChange, ChangeEvent, ChangeKind, RawChange, RowChange, SettingsChange,
};
pub use collection::{Collection, OrderBy, UnknownCollection};
pub use event_bus::EventBus;
pub use record_id::RecordId;
pub use records::{
    Announcement, ChatMessage, CnflHistory, LeagueEvent, ParticipantTeam, Player, Record,
    ReplacementRequest, ReplacementStatus, Role, SiteSettings, Team, UserProfile,
};
pub use snapshot::Snapshot;
