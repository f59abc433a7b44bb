//! PostgreSQL implementation of [`DataGateway`].
//!
//! Rows are read with `to_jsonb` and written through
//! `jsonb_populate_record`, so the JSON shape of every row is exactly the
//! table's column set. Change notifications come from the trigger installed
//! by `migrations/0001_cnfl_schema.sql`, which publishes every committed
//! row change on a `LISTEN`/`NOTIFY` channel.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use tokio::sync::broadcast;

use super::DataGateway;
use crate::domain::{Collection, OrderBy, RawChange, RecordId};
use crate::error::GatewayError;

/// Default notification channel used by the schema trigger.
pub const DEFAULT_CHANGE_CHANNEL: &str = "cnfl_changes";

/// Capacity of each subscriber's change channel.
const CHANGE_CAPACITY: usize = 1024;

/// PostgreSQL-backed gateway using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
    channel: String,
}

impl PgGateway {
    /// Creates a gateway over an existing pool, listening on `channel`.
    #[must_use]
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    /// Opens a connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the database is unreachable.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
        channel: impl Into<String>,
    ) -> Result<Self, GatewayError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, channel))
    }

    /// Applies the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), GatewayError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_row<'e, E>(
        executor: E,
        collection: Collection,
        record: Value,
    ) -> Result<Value, GatewayError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let mut fields = into_object(record)?;
        let unassigned = fields
            .get("id")
            .is_some_and(|id| matches!(id, Value::Null) || id.as_str() == Some(""));
        if unassigned {
            fields.remove("id");
        }

        let table = collection.table_name();
        let columns = column_list(fields.keys().map(String::as_str))?;
        let sql = if columns.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES RETURNING to_jsonb({table}.*)")
        } else {
            format!(
                "INSERT INTO {table} ({columns}) \
                 SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) \
                 RETURNING to_jsonb({table}.*)"
            )
        };
        let row = sqlx::query_scalar::<_, Value>(&sql)
            .bind(Value::Object(fields))
            .fetch_one(executor)
            .await?;
        Ok(row)
    }

    async fn update_row<'e, E>(
        executor: E,
        collection: Collection,
        id: &RecordId,
        fields: Map<String, Value>,
    ) -> Result<Option<Value>, GatewayError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let table = collection.table_name();
        let columns = column_list(fields.keys().map(String::as_str).filter(|k| *k != "id"))?;
        let sql = if columns.is_empty() {
            format!("SELECT to_jsonb(t) FROM {table} t WHERE t.id::text = $2")
        } else {
            format!(
                "UPDATE {table} SET ({columns}) = \
                 (SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1)) \
                 WHERE id::text = $2 RETURNING to_jsonb({table}.*)"
            )
        };
        let row = sqlx::query_scalar::<_, Value>(&sql)
            .bind(Value::Object(fields))
            .bind(id.as_str())
            .fetch_optional(executor)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl DataGateway for PgGateway {
    async fn read_all(
        &self,
        collection: Collection,
        order: Option<OrderBy>,
    ) -> Result<Vec<Value>, GatewayError> {
        let table = collection.table_name();
        let sql = match order {
            Some(order) => format!(
                "SELECT to_jsonb(t) FROM {table} t ORDER BY t.{} {}",
                quote_ident(order.column)?,
                if order.ascending { "ASC" } else { "DESC" }
            ),
            None => format!("SELECT to_jsonb(t) FROM {table} t"),
        };
        let rows = sqlx::query_scalar::<_, Value>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn read_single(&self, collection: Collection) -> Result<Option<Value>, GatewayError> {
        let table = collection.table_name();
        let row = sqlx::query_scalar::<_, Value>(&format!(
            "SELECT to_jsonb(t) FROM {table} t LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn read_by_id(
        &self,
        collection: Collection,
        id: &RecordId,
    ) -> Result<Option<Value>, GatewayError> {
        let table = collection.table_name();
        let row = sqlx::query_scalar::<_, Value>(&format!(
            "SELECT to_jsonb(t) FROM {table} t WHERE t.id::text = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn insert(&self, collection: Collection, record: Value) -> Result<Value, GatewayError> {
        Self::insert_row(&self.pool, collection, record).await
    }

    async fn insert_many(
        &self,
        collection: Collection,
        records: Vec<Value>,
    ) -> Result<Vec<Value>, GatewayError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(records.len());
        for record in records {
            inserted.push(Self::insert_row(&mut *tx, collection, record).await?);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn update(
        &self,
        collection: Collection,
        id: &RecordId,
        patch: Value,
    ) -> Result<Value, GatewayError> {
        let fields = into_object(patch)?;
        Self::update_row(&self.pool, collection, id, fields)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("no {collection} row with id {id}")))
    }

    async fn upsert(&self, collection: Collection, record: Value) -> Result<Value, GatewayError> {
        let table = collection.table_name();
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query_scalar::<_, String>(&format!(
            "SELECT id::text FROM {table} LIMIT 1 FOR UPDATE"
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let row = match existing {
            Some(id) => {
                let fields = into_object(record)?;
                Self::update_row(&mut *tx, collection, &RecordId::new(id), fields)
                    .await?
                    .ok_or_else(|| {
                        GatewayError::NotFound(format!("{collection} row vanished during upsert"))
                    })?
            }
            None => Self::insert_row(&mut *tx, collection, record).await?,
        };
        tx.commit().await?;
        Ok(row)
    }

    async fn delete(&self, collection: Collection, id: &RecordId) -> Result<(), GatewayError> {
        let table = collection.table_name();
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE id::text = $1"))
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!(
                "no {collection} row with id {id}"
            )));
        }
        Ok(())
    }

    async fn subscribe_changes(&self) -> Result<broadcast::Receiver<RawChange>, GatewayError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;

        let (tx, rx) = broadcast::channel(CHANGE_CAPACITY);
        let notifications = listener
            .into_stream()
            .map(|received| received.map(|notification| notification.payload().to_owned()));
        tokio::spawn(forward_changes(self.channel.clone(), notifications, tx));
        tracing::info!(channel = %self.channel, "listening for row changes");
        Ok(rx)
    }
}

/// Parses notification payloads and forwards them to `tx`.
///
/// Returns, dropping the listener connection, when the source ends or fails
/// or when the last receiver is gone, whether or not anything is notified.
async fn forward_changes<S, E>(channel: String, mut notifications: S, tx: broadcast::Sender<RawChange>)
where
    S: Stream<Item = Result<String, E>> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let payload = tokio::select! {
            () = tx.closed() => {
                tracing::debug!(%channel, "no change subscribers left, closing listener");
                break;
            }
            next = notifications.next() => match next {
                Some(Ok(payload)) => payload,
                Some(Err(e)) => {
                    tracing::error!(%channel, error = %e, "change listener failed");
                    break;
                }
                None => {
                    tracing::info!(%channel, "change listener ended");
                    break;
                }
            },
        };
        let change: RawChange = match serde_json::from_str(&payload) {
            Ok(change) => change,
            Err(e) => {
                tracing::warn!(%channel, error = %e, "dropping malformed change notification");
                continue;
            }
        };
        if tx.send(change).is_err() {
            tracing::debug!(%channel, "no change subscribers left, closing listener");
            break;
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                match db.code().as_deref() {
                    Some(code) if code.starts_with("23") => Self::Constraint(message),
                    Some("42501") => Self::Authorization(message),
                    // Undefined column / datatype mismatch in a written row.
                    Some("42703" | "22P02" | "42804") => Self::Constraint(message),
                    _ => Self::Transport(message),
                }
            }
            _ => Self::Transport(err.to_string()),
        }
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>, GatewayError> {
    match value {
        Value::Object(fields) => Ok(fields),
        _ => Err(GatewayError::Constraint(
            "row must be a JSON object".to_string(),
        )),
    }
}

/// Quotes a column name after checking it is a plain identifier.
fn quote_ident(name: &str) -> Result<String, GatewayError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(GatewayError::Constraint(format!(
            "invalid column name: {name:?}"
        )));
    }
    Ok(format!("\"{name}\""))
}

fn column_list<'a>(names: impl Iterator<Item = &'a str>) -> Result<String, GatewayError> {
    let quoted = names.map(quote_ident).collect::<Result<Vec<_>, _>>()?;
    Ok(quoted.join(", "))
}
