//! Snapshot store: initial load, change-stream reconciliation, and
//! write-through actions.
//!
//! Lifecycle:
//!
//! 1. [`SnapshotStore::start`] opens the change subscription, then runs one
//!    concurrent batch of reads (one per collection) under a timeout.
//! 2. Changes that arrive while the load is in flight are journaled. When
//!    the load succeeds they are replayed in arrival order on top of the
//!    loaded data, and only then is the snapshot published.
//! 3. Afterwards every change is applied as it arrives.
//! 4. [`SnapshotStore::shutdown`] releases the subscription; the result of
//!    a load still in flight is discarded.
//!
//! Write actions go to the gateway and return the server-confirmed row.
//! They never touch the snapshot: the change stream is its only writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

use crate::domain::{
    Announcement, AppliedChange, ChangeEvent, ChatMessage, CnflHistory, Collection, EventBus,
    LeagueEvent, ParticipantTeam, Player, RawChange, Record, RecordId, ReplacementRequest,
    ReplacementStatus, SiteSettings, Snapshot, Team, UserProfile,
};
use crate::error::{GatewayError, StoreError};
use crate::gateway::DataGateway;

/// Default bound on the initial load.
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capacity of the applied-change bus.
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 10_000;

/// Tunables for a [`SnapshotStore`].
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Upper bound on the initial load; expiry is a load failure.
    pub load_timeout: Duration,
    /// Capacity of the applied-change broadcast channel.
    pub event_bus_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            event_bus_capacity: DEFAULT_EVENT_BUS_CAPACITY,
        }
    }
}

/// Where the store is in its load lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    /// `start` has not been called.
    NotLoaded,
    /// The initial load is in flight.
    Loading,
    /// The snapshot reflects the backend and is kept current.
    Loaded,
    /// The initial load failed; the store stays unloaded.
    Failed(String),
}

/// Owner of the live [`Snapshot`].
#[derive(Debug)]
pub struct SnapshotStore {
    gateway: Arc<dyn DataGateway>,
    snapshot: watch::Sender<Arc<Snapshot>>,
    load_state: watch::Sender<LoadState>,
    /// Reconcile lock. Holds the journal while the initial load runs.
    journal: Mutex<Option<Vec<ChangeEvent>>>,
    event_bus: EventBus,
    listener: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
    load_timeout: Duration,
}

impl SnapshotStore {
    /// Creates an unloaded store over `gateway`.
    #[must_use]
    pub fn new(gateway: Arc<dyn DataGateway>, options: StoreOptions) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Snapshot::default()));
        let (load_state, _) = watch::channel(LoadState::NotLoaded);
        Self {
            gateway,
            snapshot,
            load_state,
            journal: Mutex::new(None),
            event_bus: EventBus::new(options.event_bus_capacity),
            listener: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            load_timeout: options.load_timeout,
        }
    }

    /// Subscribes to the change stream and performs the initial load.
    ///
    /// # Errors
    ///
    /// - [`StoreError::AlreadyStarted`] on a second call.
    /// - [`StoreError::Subscribe`] if the change stream cannot be opened.
    /// - [`StoreError::Load`] / [`StoreError::Decode`] if any read fails.
    /// - [`StoreError::LoadTimeout`] if the load outlives the timeout.
    /// - [`StoreError::Closed`] if the store was shut down meanwhile.
    ///
    /// Any error leaves the store unloaded for good.
    pub async fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StoreError::AlreadyStarted);
        }
        if self.is_closed() {
            return Err(StoreError::Closed);
        }

        *self.journal.lock().await = Some(Vec::new());
        self.load_state.send_replace(LoadState::Loading);

        let changes = match self.gateway.subscribe_changes().await {
            Ok(changes) => changes,
            Err(e) => {
                let err = StoreError::Subscribe(e);
                return self.finish_load(Err(err)).await;
            }
        };
        let handle = tokio::spawn(listen(Arc::downgrade(self), changes));
        {
            let mut listener = self.listener.lock().await;
            // A shutdown that ran while subscribing found no listener to stop.
            if self.is_closed() {
                handle.abort();
                drop(listener);
                return self.finish_load(Err(StoreError::Closed)).await;
            }
            *listener = Some(handle);
        }
        tracing::info!("change subscription open, loading snapshot");

        let loaded = match tokio::time::timeout(self.load_timeout, self.load()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::LoadTimeout(self.load_timeout)),
        };
        self.finish_load(loaded).await
    }

    /// Runs [`SnapshotStore::start`] on its own task.
    ///
    /// A [`SnapshotStore::shutdown`] while the load is in flight lets the
    /// load finish; the task then yields [`StoreError::Closed`].
    #[must_use]
    pub fn start_in_background(self: &Arc<Self>) -> JoinHandle<Result<(), StoreError>> {
        let store = Arc::clone(self);
        tokio::spawn(async move { store.start().await })
    }

    /// Releases the change subscription. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        tracing::info!("snapshot store shut down");
    }

    /// Decodes a raw gateway notification and applies it.
    ///
    /// # Errors
    ///
    /// Returns the decode error for notifications that name an unknown
    /// table or carry a row of the wrong shape; the snapshot is untouched.
    pub async fn ingest(&self, raw: RawChange) -> Result<(), StoreError> {
        let event = ChangeEvent::decode(raw)?;
        self.apply_change(event).await;
        Ok(())
    }

    /// Applies one typed change in arrival order.
    ///
    /// Journaled while the initial load runs; dropped when the store is
    /// not loaded or already shut down.
    pub async fn apply_change(&self, event: ChangeEvent) {
        let mut journal = self.journal.lock().await;
        if self.is_closed() {
            return;
        }
        if let Some(pending) = journal.as_mut() {
            pending.push(event);
            return;
        }
        if *self.load_state.borrow() != LoadState::Loaded {
            tracing::debug!(collection = %event.collection(), "store not loaded, dropping change");
            return;
        }
        self.snapshot
            .send_modify(|current| *current = Arc::new(current.apply(&event)));
        self.event_bus.publish(AppliedChange::from(&event));
        drop(journal);
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.snapshot.borrow())
    }

    /// A receiver notified whenever a new snapshot is published.
    #[must_use]
    pub fn subscribe_snapshot(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot.subscribe()
    }

    /// The current load state.
    #[must_use]
    pub fn load_state(&self) -> LoadState {
        self.load_state.borrow().clone()
    }

    /// A receiver notified on every load-state transition.
    #[must_use]
    pub fn subscribe_load_state(&self) -> watch::Receiver<LoadState> {
        self.load_state.subscribe()
    }

    /// Whether the initial load has completed successfully.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        *self.load_state.borrow() == LoadState::Loaded
    }

    /// Receives an [`AppliedChange`] after every reconciled event.
    #[must_use]
    pub fn subscribe_applied(&self) -> broadcast::Receiver<AppliedChange> {
        self.event_bus.subscribe()
    }

    /// Returns the applied-change bus.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Number of changes journaled behind the in-flight load.
    pub async fn pending_changes(&self) -> usize {
        self.journal.lock().await.as_ref().map_or(0, Vec::len)
    }

    /// Inserts a row; returns the row as stored.
    pub async fn create<T: Record>(&self, record: &T) -> Option<T> {
        let collection = T::COLLECTION;
        let body = encode(collection, record)?;
        let result = self.gateway.insert(collection, body).await;
        confirm(collection, "insert", result)
    }

    /// Writes every field of `record` to the row with the same id.
    pub async fn update<T: Record>(&self, record: &T) -> Option<T> {
        let collection = T::COLLECTION;
        let mut body = encode(collection, record)?;
        if let Value::Object(fields) = &mut body {
            fields.remove("id");
        }
        self.patch(record.id(), body).await
    }

    /// Applies a partial update to one row.
    pub async fn patch<T: Record>(&self, id: &RecordId, patch: Value) -> Option<T> {
        let collection = T::COLLECTION;
        let result = self.gateway.update(collection, id, patch).await;
        confirm(collection, "update", result)
    }

    /// Deletes a row; `true` when the backend confirmed it.
    pub async fn delete(&self, collection: Collection, id: &RecordId) -> bool {
        match self.gateway.delete(collection, id).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%collection, %id, error = %e, "delete failed");
                false
            }
        }
    }

    /// Replaces a player's points sequence.
    pub async fn update_player_points(&self, id: &RecordId, points: &[i64]) -> Option<Player> {
        self.patch(id, json!({ "points": points })).await
    }

    /// Inserts several players in one atomic batch; empty on failure.
    pub async fn add_players_bulk(&self, players: &[Player]) -> Vec<Player> {
        let collection = Collection::Players;
        let Some(rows) = players
            .iter()
            .map(|player| encode(collection, player))
            .collect::<Option<Vec<_>>>()
        else {
            return Vec::new();
        };
        match self.gateway.insert_many(collection, rows).await {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| decode_confirmed(collection, row))
                .collect(),
            Err(e) => {
                tracing::warn!(%collection, count = players.len(), error = %e, "bulk insert failed");
                Vec::new()
            }
        }
    }

    /// Sets the status of a replacement request.
    pub async fn update_replacement_status(
        &self,
        id: &RecordId,
        status: ReplacementStatus,
    ) -> Option<ReplacementRequest> {
        self.patch(id, json!({ "status": status })).await
    }

    /// Posts a chat message.
    pub async fn send_chat_message(&self, message: &ChatMessage) -> Option<ChatMessage> {
        self.create(message).await
    }

    /// Replaces the settings singleton wholesale.
    pub async fn update_site_settings(&self, settings: &SiteSettings) -> Option<SiteSettings> {
        let collection = Collection::SiteSettings;
        let mut body = encode(collection, settings)?;
        if let Value::Object(fields) = &mut body {
            fields.remove("id");
        }
        let result = self.gateway.upsert(collection, body).await;
        confirm(collection, "upsert", result)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn load(&self) -> Result<Snapshot, StoreError> {
        let gateway = self.gateway.as_ref();
        let (
            users,
            events,
            teams,
            players,
            participant_teams,
            replacement_requests,
            announcements,
            chat_messages,
            cnfl_history,
            site_settings,
        ) = tokio::try_join!(
            load_rows::<UserProfile>(gateway),
            load_rows::<LeagueEvent>(gateway),
            load_rows::<Team>(gateway),
            load_rows::<Player>(gateway),
            load_rows::<ParticipantTeam>(gateway),
            load_rows::<ReplacementRequest>(gateway),
            load_rows::<Announcement>(gateway),
            load_rows::<ChatMessage>(gateway),
            load_rows::<CnflHistory>(gateway),
            load_settings(gateway),
        )?;
        Ok(Snapshot {
            users: Arc::new(users),
            events: Arc::new(events),
            teams: Arc::new(teams),
            players: Arc::new(players),
            participant_teams: Arc::new(participant_teams),
            replacement_requests: Arc::new(replacement_requests),
            announcements: Arc::new(announcements),
            chat_messages: Arc::new(chat_messages),
            cnfl_history: Arc::new(cnfl_history),
            site_settings: Arc::new(site_settings),
        })
    }

    /// Publishes the loaded snapshot with the journal replayed on top, or
    /// records the failure.
    async fn finish_load(&self, loaded: Result<Snapshot, StoreError>) -> Result<(), StoreError> {
        let mut journal = self.journal.lock().await;
        let pending = journal.take().unwrap_or_default();

        if self.is_closed() {
            self.load_state
                .send_replace(LoadState::Failed(StoreError::Closed.to_string()));
            drop(journal);
            if let Some(handle) = self.listener.lock().await.take() {
                handle.abort();
            }
            tracing::info!(discarded = pending.len(), "store closed during load, result discarded");
            return Err(StoreError::Closed);
        }

        match loaded {
            Ok(mut snapshot) => {
                for event in &pending {
                    snapshot = snapshot.apply(event);
                }
                self.snapshot.send_replace(Arc::new(snapshot));
                self.load_state.send_replace(LoadState::Loaded);
                for event in &pending {
                    self.event_bus.publish(AppliedChange::from(event));
                }
                drop(journal);
                tracing::info!(replayed = pending.len(), "snapshot loaded");
                Ok(())
            }
            Err(err) => {
                self.load_state
                    .send_replace(LoadState::Failed(err.to_string()));
                drop(journal);
                if let Some(handle) = self.listener.lock().await.take() {
                    handle.abort();
                }
                tracing::error!(error = %err, discarded = pending.len(), "initial load failed");
                Err(err)
            }
        }
    }
}

/// Forwards gateway notifications to the store until the stream closes or
/// the store is dropped.
async fn listen(store: Weak<SnapshotStore>, mut changes: broadcast::Receiver<RawChange>) {
    loop {
        match changes.recv().await {
            Ok(raw) => {
                let Some(store) = store.upgrade() else {
                    break;
                };
                let table = raw.table.clone();
                if let Err(e) = store.ingest(raw).await {
                    tracing::warn!(%table, error = %e, "skipping undecodable change");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "change stream lagged, snapshot may be stale");
            }
            Err(RecvError::Closed) => {
                tracing::info!("change stream closed");
                break;
            }
        }
    }
}

async fn load_rows<T: Record>(gateway: &dyn DataGateway) -> Result<Vec<T>, StoreError> {
    let collection = T::COLLECTION;
    let rows = gateway
        .read_all(collection, collection.load_order())
        .await
        .map_err(|source| StoreError::Load { collection, source })?;
    let mut rows = rows
        .into_iter()
        .map(serde_json::from_value)
        .collect::<Result<Vec<T>, _>>()
        .map_err(|source| StoreError::Decode { collection, source })?;
    T::arrange(&mut rows);
    Ok(rows)
}

async fn load_settings(gateway: &dyn DataGateway) -> Result<SiteSettings, StoreError> {
    let collection = Collection::SiteSettings;
    let row = gateway
        .read_single(collection)
        .await
        .map_err(|source| StoreError::Load { collection, source })?;
    match row {
        Some(row) => {
            serde_json::from_value(row).map_err(|source| StoreError::Decode { collection, source })
        }
        None => Ok(SiteSettings::default()),
    }
}

fn encode<T: Serialize>(collection: Collection, record: &T) -> Option<Value> {
    match serde_json::to_value(record) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(%collection, error = %e, "failed to encode row");
            None
        }
    }
}

fn confirm<T: serde::de::DeserializeOwned>(
    collection: Collection,
    operation: &'static str,
    result: Result<Value, GatewayError>,
) -> Option<T> {
    match result {
        Ok(row) => decode_confirmed(collection, row),
        Err(e) => {
            tracing::warn!(%collection, operation, category = e.category(), error = %e, "write failed");
            None
        }
    }
}

fn decode_confirmed<T: serde::de::DeserializeOwned>(collection: Collection, row: Value) -> Option<T> {
    match serde_json::from_value(row) {
        Ok(row) => Some(row),
        Err(e) => {
            tracing::warn!(%collection, error = %e, "backend returned an undecodable row");
            None
        }
    }
}
