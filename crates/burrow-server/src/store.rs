use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::error::ServerError;

/// Schema version. Bump when the schema changes.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    key TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS subscriptions (
    subscriber TEXT NOT NULL REFERENCES users(key),
    subscribed TEXT NOT NULL REFERENCES users(key),
    PRIMARY KEY (subscriber, subscribed)
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_subscribed
    ON subscriptions(subscribed);
";

/// Durable directed-edge table of presence subscriptions. Edges outlive
/// sessions; user rows are created on demand.
pub struct SubscriptionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SubscriptionStore {
    /// Open (or create) the store and run migrations.
    pub fn open(path: &str, key: &str) -> Result<Self, ServerError> {
        let conn = Connection::open(path)
            .map_err(|e| ServerError::Database(format!("failed to open store: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| ServerError::Database(format!("failed to set WAL mode: {e}")))?;
        Self::init(conn, key)
    }

    /// In-memory store, used by tests.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn open_in_memory() -> Result<Self, ServerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServerError::Database(format!("failed to open store: {e}")))?;
        Self::init(conn, "")
    }

    fn init(conn: Connection, key: &str) -> Result<Self, ServerError> {
        if !key.is_empty() {
            // No-op on stock SQLite; keys the database under SQLCipher builds.
            conn.pragma_update(None, "key", key)
                .map_err(|e| ServerError::Database(format!("failed to apply store key: {e}")))?;
        }
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| ServerError::Database(format!("failed to enable foreign keys: {e}")))?;

        let current: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);
        if current != SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)
                .map_err(|e| ServerError::Database(format!("failed to run schema: {e}")))?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(|e| ServerError::Database(format!("failed to set schema version: {e}")))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Record that `subscriber` wants presence updates about `subscribed`.
    /// Idempotent; creates user rows as needed.
    pub fn add_edge(&self, subscriber: &str, subscribed: &str) -> Result<(), ServerError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (key) VALUES (?1)",
            params![subscriber],
        )
        .map_err(db_err)?;
        conn.execute(
            "INSERT OR IGNORE INTO users (key) VALUES (?1)",
            params![subscribed],
        )
        .map_err(db_err)?;
        conn.execute(
            "INSERT OR IGNORE INTO subscriptions (subscriber, subscribed) VALUES (?1, ?2)",
            params![subscriber, subscribed],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Remove a subscription edge, if present.
    pub fn remove_edge(&self, subscriber: &str, subscribed: &str) -> Result<(), ServerError> {
        self.lock()?
            .execute(
                "DELETE FROM subscriptions WHERE subscriber = ?1 AND subscribed = ?2",
                params![subscriber, subscribed],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Everyone subscribed to `target`.
    pub fn subscribers_of(&self, target: &str) -> Result<HashSet<String>, ServerError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT subscriber FROM subscriptions WHERE subscribed = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![target], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ServerError> {
        self.conn
            .lock()
            .map_err(|e| ServerError::Database(format!("store lock poisoned: {e}")))
    }
}

fn db_err(e: rusqlite::Error) -> ServerError {
    ServerError::Database(e.to_string())
}
