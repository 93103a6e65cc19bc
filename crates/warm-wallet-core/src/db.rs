// SQLite persistence for the two local record kinds: Wallet and Channel.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

/// A persisted wallet row. There is at most one per database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletRecord {
    pub address: String,
    pub private_key: String,
}

/// A persisted channel row. `channel_config` is stored as opaque JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    pub id: String,
    pub channel_config: Map<String, Value>,
    pub suggester_url: String,
}

/// The storage operations the orchestrator needs: create and find-one for
/// each record kind.
pub trait RecordStore: Send + Sync {
    /// Return any existing wallet row.
    fn find_wallet(&self) -> Result<Option<WalletRecord>>;

    /// Insert a wallet row. Fails if the address or key already exists.
    fn create_wallet(&self, record: &WalletRecord) -> Result<()>;

    /// Look a channel up by id.
    fn find_channel(&self, id: &str) -> Result<Option<ChannelRecord>>;

    /// Insert a channel row. Fails if the id already exists.
    fn create_channel(&self, record: &ChannelRecord) -> Result<()>;
}

/// SQLite-backed [`RecordStore`].
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure both tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database (useful
    /// for tests).
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS wallets (
                address     TEXT PRIMARY KEY,
                private_key TEXT NOT NULL UNIQUE,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS channels (
                id             TEXT PRIMARY KEY,
                channel_config TEXT NOT NULL,
                suggester_url  TEXT NOT NULL
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock).
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }
}

impl RecordStore for Database {
    fn find_wallet(&self) -> Result<Option<WalletRecord>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT address, private_key FROM wallets ORDER BY created_at LIMIT 1",
            [],
            |row| {
                Ok(WalletRecord {
                    address: row.get(0)?,
                    private_key: row.get(1)?,
                })
            },
        )
        .optional()
        .context("failed to query wallet")
    }

    fn create_wallet(&self, record: &WalletRecord) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO wallets (address, private_key) VALUES (?1, ?2)",
            params![record.address, record.private_key],
        )
        .context("failed to create wallet")?;
        Ok(())
    }

    fn find_channel(&self, id: &str) -> Result<Option<ChannelRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, channel_config, suggester_url FROM channels WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .context("failed to query channel")?;

        match row {
            Some((id, config_json, suggester_url)) => {
                let channel_config: Map<String, Value> = serde_json::from_str(&config_json)
                    .context("failed to deserialize channel config")?;
                Ok(Some(ChannelRecord {
                    id,
                    channel_config,
                    suggester_url,
                }))
            }
            None => Ok(None),
        }
    }

    fn create_channel(&self, record: &ChannelRecord) -> Result<()> {
        let conn = self.conn();
        let config_json = serde_json::to_string(&record.channel_config)
            .context("failed to serialize channel config")?;
        conn.execute(
            "INSERT INTO channels (id, channel_config, suggester_url) VALUES (?1, ?2, ?3)",
            params![record.id, config_json, record.suggester_url],
        )
        .context("failed to create channel")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Helper: create a fresh in-memory database for each test.
    fn test_db() -> Database {
        Database::open(":memory:").expect("in-memory database should open")
    }

    fn sample_wallet() -> WalletRecord {
        WalletRecord {
            address: "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf".to_string(),
            private_key: format!("0x{}1", "0".repeat(63)),
        }
    }

    #[test]
    fn open_creates_schema_in_memory() {
        let db = test_db();
        assert_eq!(db.find_wallet().unwrap(), None);
        assert_eq!(db.find_channel("missing").unwrap(), None);
    }

    #[test]
    fn open_is_idempotent_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.db");
        let path = path.to_str().unwrap();

        {
            let db = Database::open(path).unwrap();
            db.create_wallet(&sample_wallet()).unwrap();
        }

        let reopened = Database::open(path).unwrap();
        assert_eq!(reopened.find_wallet().unwrap(), Some(sample_wallet()));
    }

    #[test]
    fn wallet_round_trip() {
        let db = test_db();
        db.create_wallet(&sample_wallet()).unwrap();
        assert_eq!(db.find_wallet().unwrap(), Some(sample_wallet()));
    }

    #[test]
    fn duplicate_wallet_is_rejected() {
        let db = test_db();
        db.create_wallet(&sample_wallet()).unwrap();
        assert!(db.create_wallet(&sample_wallet()).is_err());
    }

    #[test]
    fn channel_round_trip_preserves_config() {
        let db = test_db();
        let config = json!({ "asset": "ETH", "depth": 3, "nested": { "ok": true } });
        let record = ChannelRecord {
            id: "chan-1".to_string(),
            channel_config: config.as_object().unwrap().clone(),
            suggester_url: "wss://suggester.example".to_string(),
        };
        db.create_channel(&record).unwrap();

        assert_eq!(db.find_channel("chan-1").unwrap(), Some(record));
        assert_eq!(db.find_channel("chan-2").unwrap(), None);
    }

    #[test]
    fn duplicate_channel_id_is_rejected() {
        let db = test_db();
        let record = ChannelRecord {
            id: "chan-1".to_string(),
            channel_config: Map::new(),
            suggester_url: "wss://a".to_string(),
        };
        db.create_channel(&record).unwrap();
        assert!(db.create_channel(&record).is_err());
    }
}
