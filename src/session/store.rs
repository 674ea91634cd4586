//! Two-tier session store: in-memory map in front of a SQLite table.
//!
//! Writes hit the map synchronously and are persisted by a single background
//! worker, so durable writes for one session are applied in the order they
//! were issued. The map is authoritative; durable errors are logged, except a
//! failed read on cache miss which is returned to the caller.
//!
//! Cache fills and removals are serialized by `fill`, and a removal holds it
//! until the row is gone, so a removed session cannot be reloaded. Expired
//! sessions leave the map whenever a new one is saved.

use crate::{
    identity::{BackendToken, TokenVersion, token::RecordError},
    totp::TotpState,
};
use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{collections::HashMap, str::FromStr};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{Instrument, Span, debug, error, info_span, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt session record: {0}")]
    Record(#[from] RecordError),
    #[error("corrupt session json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    pub token: BackendToken,
    pub totp: TotpState,
}

struct Record {
    session_id: String,
    token: String,
    token_str: String,
    totp: String,
    version: TokenVersion,
    expire_at: DateTime<Utc>,
}

enum PersistCommand {
    Insert(Record),
    Update(Record),
    UpdateTotp { session_id: String, totp: String },
    Remove { session_id: String, done: oneshot::Sender<()> },
    Flush(oneshot::Sender<()>),
}

pub struct SessionStore {
    entries: RwLock<HashMap<String, SessionEntry>>,
    fill: Mutex<()>,
    pool: SqlitePool,
    persist: mpsc::UnboundedSender<PersistCommand>,
    version: TokenVersion,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Open (creating if needed) the SQLite store at `dsn` and start the persistence worker.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)
            .with_context(|| format!("Invalid session store DSN: {dsn}"))?
            .create_if_missing(true);

        // every connection to an in-memory database is a different database
        let in_memory = dsn.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open session store")?;

        migrate(&pool).await?;

        Ok(Self::with_pool(pool))
    }

    fn with_pool(pool: SqlitePool) -> Self {
        let (persist, rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_worker(pool.clone(), rx));
        Self {
            entries: RwLock::new(HashMap::new()),
            fill: Mutex::new(()),
            pool,
            persist,
            version: TokenVersion::V3,
        }
    }

    /// Allocate a session for `token` and return its id.
    #[instrument(name = "session.save", skip_all, fields(user = %token.user))]
    pub async fn save(&self, token: BackendToken, totp: TotpState) -> String {
        let session_id = Uuid::new_v4().to_string();
        let entry = SessionEntry { token, totp };
        let record = self.record(&session_id, &entry);

        {
            let mut entries = self.entries.write().await;
            let now = Utc::now();
            let before = entries.len();
            entries.retain(|_, cached| cached.token.expires_at > now);
            if entries.len() < before {
                debug!("evicted {} expired sessions", before - entries.len());
            }
            entries.insert(session_id.clone(), entry);
        }

        match record {
            Ok(record) => self.send(PersistCommand::Insert(record)),
            Err(err) => error!("Failed to serialize session {}: {}", session_id, err),
        }

        debug!("session {} saved", session_id);

        session_id
    }

    /// Backend token of the session. Validity is the caller's concern.
    ///
    /// # Errors
    /// Returns an error if the durable lookup on cache miss fails.
    pub async fn get(&self, session_id: &str) -> Result<Option<BackendToken>, StoreError> {
        Ok(self.entry(session_id).await?.map(|entry| entry.token))
    }

    /// # Errors
    /// Returns an error if the durable lookup on cache miss fails.
    pub async fn get_totp(&self, session_id: &str) -> Result<Option<TotpState>, StoreError> {
        Ok(self.entry(session_id).await?.map(|entry| entry.totp))
    }

    /// Token and TOTP state together.
    ///
    /// # Errors
    /// Returns an error if the durable lookup on cache miss fails.
    #[instrument(name = "session.lookup", skip_all, fields(cached = true))]
    pub async fn entry(&self, session_id: &str) -> Result<Option<SessionEntry>, StoreError> {
        if let Some(entry) = self.entries.read().await.get(session_id) {
            return Ok(Some(entry.clone()));
        }
        Span::current().record("cached", false);

        let _fill = self.fill.lock().await;
        if let Some(entry) = self.entries.read().await.get(session_id) {
            return Ok(Some(entry.clone()));
        }

        let Some(entry) = self.load(session_id).await? else {
            return Ok(None);
        };

        let mut entries = self.entries.write().await;
        let cached = entries
            .entry(session_id.to_string())
            .or_insert(entry)
            .clone();
        Ok(Some(cached))
    }

    /// Overwrite the TOTP state and persist only the TOTP column.
    ///
    /// # Errors
    /// Returns an error if the durable lookup on cache miss fails.
    pub async fn save_totp(&self, session_id: &str, totp: TotpState) -> Result<bool, StoreError> {
        Ok(self
            .update_totp(session_id, |state| *state = totp)
            .await?
            .is_some())
    }

    /// Apply `f` to the session's TOTP state while holding the map lock.
    ///
    /// Returns `None` when the session does not exist.
    ///
    /// # Errors
    /// Returns an error if the durable lookup on cache miss fails.
    #[instrument(name = "session.update_totp", skip_all)]
    pub async fn update_totp<F, R>(&self, session_id: &str, f: F) -> Result<Option<R>, StoreError>
    where
        F: FnOnce(&mut TotpState) -> R,
    {
        if self.entry(session_id).await?.is_none() {
            return Ok(None);
        }

        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(session_id) else {
            return Ok(None);
        };
        let result = f(&mut entry.totp);
        let totp = serde_json::to_string(&entry.totp)?;

        // queued under the lock so durable order matches memory order
        self.send(PersistCommand::UpdateTotp {
            session_id: session_id.to_string(),
            totp,
        });

        Ok(Some(result))
    }

    /// Swap the backend token of an existing session (project switch).
    ///
    /// # Errors
    /// Returns an error if the durable lookup on cache miss fails.
    #[instrument(name = "session.replace_token", skip_all, fields(user = %token.user, project = %token.project_id))]
    pub async fn replace_token(
        &self,
        session_id: &str,
        token: BackendToken,
    ) -> Result<bool, StoreError> {
        if self.entry(session_id).await?.is_none() {
            return Ok(false);
        }

        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(session_id) else {
            return Ok(false);
        };
        entry.token = token;
        let record = self.record(session_id, entry)?;
        self.send(PersistCommand::Update(record));
        Ok(true)
    }

    /// Delete the session from memory and from the durable store.
    #[instrument(name = "session.remove", skip_all)]
    pub async fn remove(&self, session_id: &str) {
        let _fill = self.fill.lock().await;
        self.entries.write().await.remove(session_id);

        let (done, wait) = oneshot::channel();
        self.send(PersistCommand::Remove {
            session_id: session_id.to_string(),
            done,
        });
        let _ = wait.await;
    }

    /// Wait until every queued durable write has been applied.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(PersistCommand::Flush(done));
        let _ = wait.await;
    }

    /// Number of sessions held in memory.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn send(&self, command: PersistCommand) {
        if self.persist.send(command).is_err() {
            error!("session persistence worker is gone");
        }
    }

    fn record(&self, session_id: &str, entry: &SessionEntry) -> Result<Record, StoreError> {
        let (token, token_str) = entry.token.to_record(self.version)?;
        Ok(Record {
            session_id: session_id.to_string(),
            token,
            token_str,
            totp: serde_json::to_string(&entry.totp)?,
            version: self.version,
            expire_at: entry.token.expires_at.trunc_subsecs(0),
        })
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionEntry>, StoreError> {
        let query = "SELECT token, token_str, totp, version, expire_at FROM token_records WHERE token_id = ?";
        let span = info_span!(
            "db.query",
            db.system = "sqlite",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expire_at: Option<DateTime<Utc>> = row.try_get("expire_at")?;
        if expire_at.is_some_and(|at| at < Utc::now()) {
            debug!("session {} expired, deleting", session_id);
            delete_record(&self.pool, session_id).await;
            return Ok(None);
        }

        let version = row
            .try_get::<String, _>("version")?
            .parse::<TokenVersion>()
            .unwrap_or(TokenVersion::V2);
        let body: String = row.try_get("token")?;
        let token_str: String = row.try_get("token_str")?;
        let token = BackendToken::from_record(version, &body, &token_str)?;

        let totp_json: String = row.try_get("totp")?;
        let totp = if totp_json.is_empty() {
            TotpState::default()
        } else {
            serde_json::from_str(&totp_json)?
        };

        Ok(Some(SessionEntry { token, totp }))
    }
}

/// Create the table, then add columns missing from older layouts.
async fn migrate(pool: &SqlitePool) -> Result<()> {
    let query = r"
        CREATE TABLE IF NOT EXISTS token_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token_id TEXT NOT NULL UNIQUE,
            token TEXT NOT NULL UNIQUE,
            expire_at TIMESTAMP
        )
    ";
    sqlx::query(query)
        .execute(pool)
        .await
        .context("Failed to create token_records")?;

    let columns: Vec<String> = sqlx::query("PRAGMA table_info(token_records)")
        .fetch_all(pool)
        .await
        .context("Failed to inspect token_records")?
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();

    let additions = [
        ("token_str", "TEXT NOT NULL DEFAULT ''"),
        ("totp", "TEXT NOT NULL DEFAULT ''"),
        ("version", "TEXT NOT NULL DEFAULT 'v2'"),
    ];
    for (column, definition) in additions {
        if columns.iter().any(|c| c == column) {
            continue;
        }
        let statement = format!("ALTER TABLE token_records ADD COLUMN {column} {definition}");
        sqlx::query(&statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to add column {column}"))?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS token_records_expire_at ON token_records (expire_at)")
        .execute(pool)
        .await
        .context("Failed to index token_records")?;

    Ok(())
}

async fn persist_worker(pool: SqlitePool, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            PersistCommand::Insert(record) => {
                if let Err(err) = upsert_record(&pool, &record).await {
                    error!("Failed to persist session {}: {}", record.session_id, err);
                    continue;
                }
                prune_expired(&pool).await;
            }
            PersistCommand::Update(record) => {
                if let Err(err) = upsert_record(&pool, &record).await {
                    error!("Failed to persist session {}: {}", record.session_id, err);
                }
            }
            PersistCommand::UpdateTotp { session_id, totp } => {
                let query = "UPDATE token_records SET totp = ? WHERE token_id = ?";
                let span = info_span!(
                    "db.query",
                    db.system = "sqlite",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                if let Err(err) = sqlx::query(query)
                    .bind(&totp)
                    .bind(&session_id)
                    .execute(&pool)
                    .instrument(span)
                    .await
                {
                    error!("Failed to persist totp of session {}: {}", session_id, err);
                }
            }
            PersistCommand::Remove { session_id, done } => {
                delete_record(&pool, &session_id).await;
                let _ = done.send(());
            }
            PersistCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("session persistence worker stopped");
}

async fn upsert_record(pool: &SqlitePool, record: &Record) -> Result<(), sqlx::Error> {
    let query = r"
        INSERT INTO token_records (token_id, token, token_str, totp, version, expire_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(token_id) DO UPDATE SET
            token = excluded.token,
            token_str = excluded.token_str,
            totp = excluded.totp,
            version = excluded.version,
            expire_at = excluded.expire_at
    ";
    let span = info_span!(
        "db.query",
        db.system = "sqlite",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(&record.session_id)
        .bind(&record.token)
        .bind(&record.token_str)
        .bind(&record.totp)
        .bind(record.version.as_str())
        .bind(record.expire_at)
        .execute(pool)
        .instrument(span)
        .await?;
    Ok(())
}

async fn prune_expired(pool: &SqlitePool) {
    let query = "DELETE FROM token_records WHERE expire_at < ?";
    let span = info_span!(
        "db.query",
        db.system = "sqlite",
        db.operation = "DELETE",
        db.statement = query
    );
    match sqlx::query(query)
        .bind(Utc::now().trunc_subsecs(0))
        .execute(pool)
        .instrument(span)
        .await
    {
        Ok(result) if result.rows_affected() > 0 => {
            debug!("pruned {} expired sessions", result.rows_affected());
        }
        Ok(_) => {}
        Err(err) => warn!("Failed to prune expired sessions: {}", err),
    }
}

async fn delete_record(pool: &SqlitePool, session_id: &str) {
    let query = "DELETE FROM token_records WHERE token_id = ?";
    let span = info_span!(
        "db.query",
        db.system = "sqlite",
        db.operation = "DELETE",
        db.statement = query
    );
    if let Err(err) = sqlx::query(query)
        .bind(session_id)
        .execute(pool)
        .instrument(span)
        .await
    {
        error!("Failed to delete session {}: {}", session_id, err);
    }
}
