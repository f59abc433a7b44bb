//! In-process backend implementing both gateway contracts.
//!
//! [`MemoryBackend`] keeps every collection as a list of JSON rows, assigns
//! UUID ids on insert, and emits a [`RawChange`] for each committed write,
//! in commit order. It also holds email/password accounts and a session.
//!
//! Reads can be held back with [`MemoryBackend::hold_reads`] and any
//! collection can be made to fail with [`MemoryBackend::fail_collection`],
//! which lets tests drive load races and failure paths deterministically.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{self, AtomicBool, AtomicUsize};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use tokio::sync::{RwLock, broadcast, watch};

use super::{AuthGateway, AuthIdentity, DataGateway, Session, SessionChange, SessionEventKind, SessionSlot};
use crate::domain::{ChangeKind, Collection, OrderBy, RawChange, RecordId};
use crate::error::GatewayError;

/// Default capacity of the change channel.
const DEFAULT_CHANGE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Account {
    id: RecordId,
    password: String,
}

/// In-memory backend with realtime change notifications.
#[derive(Debug)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<Collection, Vec<Value>>>,
    accounts: RwLock<HashMap<String, Account>>,
    session: SessionSlot,
    changes: broadcast::Sender<RawChange>,
    reads_open: watch::Sender<bool>,
    subscriptions_open: watch::Sender<bool>,
    failing: RwLock<HashSet<Collection>>,
    auth_offline: AtomicBool,
    auth_calls: AtomicUsize,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANGE_CAPACITY)
    }

    /// Creates an empty backend whose change channel buffers `capacity`
    /// notifications per lagging subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        let (reads_open, _) = watch::channel(true);
        let (subscriptions_open, _) = watch::channel(true);
        Self {
            tables: RwLock::new(HashMap::new()),
            accounts: RwLock::new(HashMap::new()),
            session: SessionSlot::new(),
            changes,
            reads_open,
            subscriptions_open,
            failing: RwLock::new(HashSet::new()),
            auth_offline: AtomicBool::new(false),
            auth_calls: AtomicUsize::new(0),
        }
    }

    /// Stores rows without emitting change notifications, as if they
    /// existed before anyone subscribed. Rows without an id get one.
    pub async fn seed(&self, collection: Collection, rows: Vec<Value>) {
        let mut tables = self.tables.write().await;
        let table = tables.entry(collection).or_default();
        for mut row in rows {
            if let Value::Object(fields) = &mut row {
                ensure_id(fields);
            }
            table.push(row);
        }
    }

    /// Broadcasts a change without touching any table.
    pub fn emit(&self, change: RawChange) -> usize {
        self.changes.send(change).unwrap_or(0)
    }

    /// Blocks every subsequent read until [`MemoryBackend::release_reads`].
    pub fn hold_reads(&self) {
        self.reads_open.send_replace(false);
    }

    /// Lets held and future reads proceed.
    pub fn release_reads(&self) {
        self.reads_open.send_replace(true);
    }

    /// Blocks every subsequent [`DataGateway::subscribe_changes`] call until
    /// [`MemoryBackend::release_subscriptions`].
    pub fn hold_subscriptions(&self) {
        self.subscriptions_open.send_replace(false);
    }

    /// Lets held and future subscriptions proceed.
    pub fn release_subscriptions(&self) {
        self.subscriptions_open.send_replace(true);
    }

    /// Number of `subscribe_changes` calls currently waiting on the gate.
    #[must_use]
    pub fn held_subscriptions(&self) -> usize {
        self.subscriptions_open.receiver_count()
    }

    /// Makes every operation on `collection` fail with a transport error.
    pub async fn fail_collection(&self, collection: Collection) {
        self.failing.write().await.insert(collection);
    }

    /// Undoes [`MemoryBackend::fail_collection`].
    pub async fn restore_collection(&self, collection: Collection) {
        self.failing.write().await.remove(&collection);
    }

    /// Makes every auth operation fail with a transport error.
    pub fn set_auth_offline(&self, offline: bool) {
        self.auth_offline.store(offline, atomic::Ordering::SeqCst);
    }

    /// Number of auth operations invoked so far.
    #[must_use]
    pub fn auth_calls(&self) -> usize {
        self.auth_calls.load(atomic::Ordering::SeqCst)
    }

    /// Number of rows currently stored in `collection`.
    pub async fn row_count(&self, collection: Collection) -> usize {
        self.tables
            .read()
            .await
            .get(&collection)
            .map_or(0, Vec::len)
    }

    /// Number of live change subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    async fn check_collection(&self, collection: Collection) -> Result<(), GatewayError> {
        if self.failing.read().await.contains(&collection) {
            return Err(GatewayError::Transport(format!(
                "{collection} is unavailable"
            )));
        }
        Ok(())
    }

    async fn wait_for_reads(&self) {
        wait_open(&self.reads_open).await;
    }

    fn check_auth(&self) -> Result<(), GatewayError> {
        self.auth_calls.fetch_add(1, atomic::Ordering::SeqCst);
        if self.auth_offline.load(atomic::Ordering::SeqCst) {
            return Err(GatewayError::Transport(
                "auth service unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn publish(&self, collection: Collection, kind: ChangeKind, record: Option<Value>, old: Option<Value>) {
        let _ = self
            .changes
            .send(RawChange::new(collection, kind, record, old));
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataGateway for MemoryBackend {
    async fn read_all(
        &self,
        collection: Collection,
        order: Option<OrderBy>,
    ) -> Result<Vec<Value>, GatewayError> {
        self.wait_for_reads().await;
        self.check_collection(collection).await?;
        let mut rows = self
            .tables
            .read()
            .await
            .get(&collection)
            .cloned()
            .unwrap_or_default();
        if let Some(order) = order {
            rows.sort_by(|a, b| {
                let ord = compare_json(a.get(order.column), b.get(order.column));
                if order.ascending { ord } else { ord.reverse() }
            });
        }
        Ok(rows)
    }

    async fn read_single(&self, collection: Collection) -> Result<Option<Value>, GatewayError> {
        self.wait_for_reads().await;
        self.check_collection(collection).await?;
        Ok(self
            .tables
            .read()
            .await
            .get(&collection)
            .and_then(|rows| rows.first().cloned()))
    }

    async fn read_by_id(
        &self,
        collection: Collection,
        id: &RecordId,
    ) -> Result<Option<Value>, GatewayError> {
        self.check_collection(collection).await?;
        Ok(self.tables.read().await.get(&collection).and_then(|rows| {
            rows.iter()
                .find(|row| row_id(row).as_ref() == Some(id))
                .cloned()
        }))
    }

    async fn insert(&self, collection: Collection, record: Value) -> Result<Value, GatewayError> {
        let mut inserted = self.insert_many(collection, vec![record]).await?;
        inserted
            .pop()
            .ok_or_else(|| GatewayError::Transport("insert returned no row".to_string()))
    }

    async fn insert_many(
        &self,
        collection: Collection,
        records: Vec<Value>,
    ) -> Result<Vec<Value>, GatewayError> {
        self.check_collection(collection).await?;
        let mut tables = self.tables.write().await;
        let table = tables.entry(collection).or_default();

        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            let Value::Object(mut fields) = record else {
                return Err(GatewayError::Constraint(
                    "row must be a JSON object".to_string(),
                ));
            };
            let id = ensure_id(&mut fields);
            let taken = table
                .iter()
                .chain(prepared.iter())
                .any(|row| row_id(row).as_ref() == Some(&id));
            if taken {
                return Err(GatewayError::Constraint(format!(
                    "duplicate key value violates unique constraint \"{collection}_pkey\""
                )));
            }
            prepared.push(Value::Object(fields));
        }

        for row in &prepared {
            table.push(row.clone());
            self.publish(collection, ChangeKind::Insert, Some(row.clone()), None);
        }
        Ok(prepared)
    }

    async fn update(
        &self,
        collection: Collection,
        id: &RecordId,
        patch: Value,
    ) -> Result<Value, GatewayError> {
        self.check_collection(collection).await?;
        let Value::Object(patch) = patch else {
            return Err(GatewayError::Constraint(
                "patch must be a JSON object".to_string(),
            ));
        };
        let mut tables = self.tables.write().await;
        let row = tables
            .get_mut(&collection)
            .and_then(|rows| rows.iter_mut().find(|row| row_id(row).as_ref() == Some(id)))
            .ok_or_else(|| GatewayError::NotFound(format!("no {collection} row with id {id}")))?;

        let old = row.clone();
        if let Value::Object(fields) = row {
            for (key, value) in patch {
                if key != "id" {
                    fields.insert(key, value);
                }
            }
        }
        let updated = row.clone();
        self.publish(collection, ChangeKind::Update, Some(updated.clone()), Some(old));
        Ok(updated)
    }

    async fn upsert(&self, collection: Collection, record: Value) -> Result<Value, GatewayError> {
        self.check_collection(collection).await?;
        let Value::Object(mut fields) = record else {
            return Err(GatewayError::Constraint(
                "row must be a JSON object".to_string(),
            ));
        };
        let mut tables = self.tables.write().await;
        let table = tables.entry(collection).or_default();

        match table.first_mut() {
            Some(existing) => {
                if let Some(id) = existing.get("id").cloned() {
                    fields.insert("id".to_string(), id);
                }
                let old = std::mem::replace(existing, Value::Object(fields));
                let updated = existing.clone();
                self.publish(collection, ChangeKind::Update, Some(updated.clone()), Some(old));
                Ok(updated)
            }
            None => {
                ensure_id(&mut fields);
                let row = Value::Object(fields);
                table.push(row.clone());
                self.publish(collection, ChangeKind::Insert, Some(row.clone()), None);
                Ok(row)
            }
        }
    }

    async fn delete(&self, collection: Collection, id: &RecordId) -> Result<(), GatewayError> {
        self.check_collection(collection).await?;
        let mut tables = self.tables.write().await;
        let rows = tables.entry(collection).or_default();
        let Some(position) = rows.iter().position(|row| row_id(row).as_ref() == Some(id)) else {
            return Err(GatewayError::NotFound(format!(
                "no {collection} row with id {id}"
            )));
        };
        let old = rows.remove(position);
        self.publish(collection, ChangeKind::Delete, None, Some(old));
        Ok(())
    }

    async fn subscribe_changes(&self) -> Result<broadcast::Receiver<RawChange>, GatewayError> {
        wait_open(&self.subscriptions_open).await;
        Ok(self.changes.subscribe())
    }
}

#[async_trait]
impl AuthGateway for MemoryBackend {
    async fn current_session(&self) -> Result<Option<Session>, GatewayError> {
        self.check_auth()?;
        Ok(self.session.get().await)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, GatewayError> {
        self.check_auth()?;
        let account = self
            .accounts
            .read()
            .await
            .get(email)
            .filter(|account| account.password == password)
            .cloned()
            .ok_or_else(|| GatewayError::Authorization("Invalid login credentials".to_string()))?;

        let session = new_session(AuthIdentity {
            id: account.id,
            email: Some(email.to_string()),
        });
        self.session
            .set(SessionEventKind::SignedIn, Some(session.clone()))
            .await;
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthIdentity, GatewayError> {
        self.check_auth()?;
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(email) {
            return Err(GatewayError::Constraint(
                "User already registered".to_string(),
            ));
        }
        let id = RecordId::generate();
        accounts.insert(
            email.to_string(),
            Account {
                id: id.clone(),
                password: password.to_string(),
            },
        );
        Ok(AuthIdentity {
            id,
            email: Some(email.to_string()),
        })
    }

    async fn sign_out(&self) -> Result<(), GatewayError> {
        let remote = self.check_auth();
        self.session.set(SessionEventKind::SignedOut, None).await;
        remote
    }

    async fn update_password(&self, new_password: &str) -> Result<(), GatewayError> {
        self.check_auth()?;
        let Some(session) = self.session.get().await else {
            return Err(GatewayError::Authorization(
                "Auth session missing!".to_string(),
            ));
        };
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .values_mut()
            .find(|account| account.id == session.user.id)
            .ok_or_else(|| GatewayError::NotFound("User not found".to_string()))?;
        account.password = new_password.to_string();
        drop(accounts);

        self.session
            .set(SessionEventKind::UserUpdated, Some(session))
            .await;
        Ok(())
    }

    async fn refresh_session(&self) -> Result<Session, GatewayError> {
        self.check_auth()?;
        let Some(current) = self.session.get().await else {
            return Err(GatewayError::Authorization(
                "Auth session missing!".to_string(),
            ));
        };
        let session = new_session(current.user);
        self.session
            .set(SessionEventKind::TokenRefreshed, Some(session.clone()))
            .await;
        Ok(session)
    }

    fn session_changes(&self) -> broadcast::Receiver<SessionChange> {
        self.session.subscribe()
    }
}

fn new_session(user: AuthIdentity) -> Session {
    Session {
        access_token: uuid::Uuid::new_v4().to_string(),
        refresh_token: Some(uuid::Uuid::new_v4().to_string()),
        expires_at: Some(Utc::now() + Duration::hours(1)),
        user,
    }
}

/// Assigns a fresh id to a row without a usable one, returning the row's id.
fn ensure_id(fields: &mut Map<String, Value>) -> RecordId {
    let existing = fields
        .get("id")
        .and_then(|id| serde_json::from_value::<RecordId>(id.clone()).ok())
        .filter(|id| !id.is_unassigned());
    match existing {
        Some(id) => id,
        None => {
            let id = RecordId::generate();
            fields.insert("id".to_string(), Value::String(id.to_string()));
            id
        }
    }
}

fn row_id(row: &Value) -> Option<RecordId> {
    row.get("id")
        .and_then(|id| serde_json::from_value(id.clone()).ok())
}

/// Orders JSON scalars the way a SQL `ORDER BY` would for one column type:
/// missing values first, then numbers numerically, strings by bytes.
fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

async fn wait_open(gate: &watch::Sender<bool>) {
    let mut open = gate.subscribe();
    // The sender lives as long as the backend, so this cannot fail.
    let _ = open.wait_for(|open| *open).await;
}
