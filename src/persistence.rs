//! Database persistence layer for PinWallet

use crate::error::{Result, WalletError};
use crate::ledger::{TransferRecord, Wallet, WalletId, WalletStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as FastMutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// How long SQLite waits on a locked database file before reporting BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A balance write that only lands if the row is still at `expected_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceUpdate {
    pub wallet: WalletId,
    pub expected_version: i64,
    pub new_balance: i64,
}

/// A transfer record before storage assigns its id and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewTransfer {
    pub from_wallet: Option<WalletId>,
    pub to_wallet: WalletId,
    pub amount: i64,
}

/// Abstraction for persistence backends. `commit` must apply every update
/// and every record together or none of them.
pub trait Persistence: Send + Sync {
    fn insert_wallet(&self, owner_id: i64, pin_hash: &str) -> Result<Wallet>;
    fn load_wallet(&self, id: WalletId) -> Result<Option<Wallet>>;
    fn list_wallets(&self, offset: u64, limit: u64) -> Result<Vec<Wallet>>;
    fn delete_wallet(&self, id: WalletId) -> Result<Option<Wallet>>;
    fn set_status(&self, id: WalletId, status: WalletStatus) -> Result<Option<Wallet>>;
    fn replace_pin_hash(&self, id: WalletId, pin_hash: &str) -> Result<bool>;
    fn commit(
        &self,
        updates: &[BalanceUpdate],
        transfers: &[NewTransfer],
    ) -> Result<Vec<TransferRecord>>;
    fn transfers_for(&self, id: WalletId, limit: u64) -> Result<Vec<TransferRecord>>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| WalletError::StorageFailure(format!("Failed to open database: {}", e)))?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        if path != ":memory:" {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL,
                balance INTEGER NOT NULL CHECK (balance >= 0),
                pin_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            WalletError::StorageFailure(format!("Failed to create wallets table: {}", e))
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_wallet_id INTEGER,
                to_wallet_id INTEGER NOT NULL,
                amount INTEGER NOT NULL CHECK (amount > 0),
                timestamp TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            WalletError::StorageFailure(format!("Failed to create transfers table: {}", e))
        })?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transfers_from ON transfers (from_wallet_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transfers_to ON transfers (to_wallet_id)",
            [],
        )?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| WalletError::StorageFailure("Mutex poisoned".to_string()))
    }
}

const WALLET_COLUMNS: &str = "id, owner_id, balance, pin_hash, status, version, created_at";

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_timestamp(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn wallet_from_row(row: &Row<'_>) -> rusqlite::Result<Wallet> {
    let status: String = row.get(4)?;
    let created_at: String = row.get(6)?;
    Ok(Wallet {
        id: WalletId(row.get(0)?),
        owner_id: row.get(1)?,
        balance: row.get(2)?,
        pin_hash: row.get(3)?,
        status: status.parse().map_err(|e| conversion_error(4, e))?,
        version: row.get(5)?,
        created_at: parse_timestamp(6, &created_at)?,
    })
}

fn transfer_from_row(row: &Row<'_>) -> rusqlite::Result<TransferRecord> {
    let timestamp: String = row.get(4)?;
    Ok(TransferRecord {
        id: row.get(0)?,
        from_wallet: row.get::<_, Option<i64>>(1)?.map(WalletId),
        to_wallet: WalletId(row.get(2)?),
        amount: row.get(3)?,
        timestamp: parse_timestamp(4, &timestamp)?,
    })
}

fn load_wallet_with(conn: &Connection, id: WalletId) -> Result<Option<Wallet>> {
    let wallet = conn
        .query_row(
            &format!("SELECT {} FROM wallets WHERE id = ?1", WALLET_COLUMNS),
            params![id.0],
            wallet_from_row,
        )
        .optional()?;
    Ok(wallet)
}

impl Persistence for Database {
    fn insert_wallet(&self, owner_id: i64, pin_hash: &str) -> Result<Wallet> {
        let created_at = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO wallets (owner_id, balance, pin_hash, status, version, created_at)
             VALUES (?1, 0, ?2, ?3, 0, ?4)",
            params![
                owner_id,
                pin_hash,
                WalletStatus::Active.as_str(),
                created_at.to_rfc3339()
            ],
        )
        .map_err(|e| WalletError::StorageFailure(format!("Failed to save wallet: {}", e)))?;

        Ok(Wallet {
            id: WalletId(conn.last_insert_rowid()),
            owner_id,
            balance: 0,
            pin_hash: pin_hash.to_string(),
            status: WalletStatus::Active,
            version: 0,
            created_at,
        })
    }

    fn load_wallet(&self, id: WalletId) -> Result<Option<Wallet>> {
        let conn = self.lock()?;
        load_wallet_with(&conn, id)
    }

    fn list_wallets(&self, offset: u64, limit: u64) -> Result<Vec<Wallet>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM wallets ORDER BY id ASC LIMIT ?1 OFFSET ?2",
            WALLET_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], wallet_from_row)?;

        let mut wallets = Vec::new();
        for row in rows {
            wallets.push(row?);
        }
        Ok(wallets)
    }

    fn delete_wallet(&self, id: WalletId) -> Result<Option<Wallet>> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let wallet = load_wallet_with(&tx, id)?;
        if wallet.is_some() {
            tx.execute("DELETE FROM wallets WHERE id = ?1", params![id.0])?;
        }
        tx.commit()?;
        Ok(wallet)
    }

    fn set_status(&self, id: WalletId, status: WalletStatus) -> Result<Option<Wallet>> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE wallets SET status = ?1, version = version + 1 WHERE id = ?2",
            params![status.as_str(), id.0],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        load_wallet_with(&conn, id)
    }

    fn replace_pin_hash(&self, id: WalletId, pin_hash: &str) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE wallets SET pin_hash = ?1 WHERE id = ?2",
            params![pin_hash, id.0],
        )?;
        Ok(changed > 0)
    }

    fn commit(
        &self,
        updates: &[BalanceUpdate],
        transfers: &[NewTransfer],
    ) -> Result<Vec<TransferRecord>> {
        let conn = self.lock()?;
        // Dropping an uncommitted transaction rolls it back.
        let tx = conn.unchecked_transaction()?;

        for update in updates {
            let changed = tx.execute(
                "UPDATE wallets SET balance = ?1, version = version + 1
                 WHERE id = ?2 AND version = ?3",
                params![update.new_balance, update.wallet.0, update.expected_version],
            )?;
            if changed == 0 {
                return Err(WalletError::ConcurrencyConflict(format!(
                    "wallet {} changed since it was read",
                    update.wallet
                )));
            }
        }

        let timestamp = Utc::now();
        let mut records = Vec::with_capacity(transfers.len());
        for transfer in transfers {
            tx.execute(
                "INSERT INTO transfers (from_wallet_id, to_wallet_id, amount, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    transfer.from_wallet.map(|w| w.0),
                    transfer.to_wallet.0,
                    transfer.amount,
                    timestamp.to_rfc3339()
                ],
            )?;
            records.push(TransferRecord {
                id: tx.last_insert_rowid(),
                from_wallet: transfer.from_wallet,
                to_wallet: transfer.to_wallet,
                amount: transfer.amount,
                timestamp,
            });
        }

        tx.commit()?;

        Ok(records)
    }

    fn transfers_for(&self, id: WalletId, limit: u64) -> Result<Vec<TransferRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, from_wallet_id, to_wallet_id, amount, timestamp FROM transfers
             WHERE from_wallet_id = ?1 OR to_wallet_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![id.0, limit as i64], transfer_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

#[derive(Default)]
struct MemoryState {
    wallets: BTreeMap<WalletId, Wallet>,
    transfers: Vec<TransferRecord>,
    next_wallet_id: i64,
    next_transfer_id: i64,
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryPersistence {
    state: FastMutex<MemoryState>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for InMemoryPersistence {
    fn insert_wallet(&self, owner_id: i64, pin_hash: &str) -> Result<Wallet> {
        let mut state = self.state.lock();
        state.next_wallet_id += 1;
        let wallet = Wallet {
            id: WalletId(state.next_wallet_id),
            owner_id,
            balance: 0,
            pin_hash: pin_hash.to_string(),
            status: WalletStatus::Active,
            version: 0,
            created_at: Utc::now(),
        };
        state.wallets.insert(wallet.id, wallet.clone());
        Ok(wallet)
    }

    fn load_wallet(&self, id: WalletId) -> Result<Option<Wallet>> {
        Ok(self.state.lock().wallets.get(&id).cloned())
    }

    fn list_wallets(&self, offset: u64, limit: u64) -> Result<Vec<Wallet>> {
        Ok(self
            .state
            .lock()
            .wallets
            .values()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn delete_wallet(&self, id: WalletId) -> Result<Option<Wallet>> {
        Ok(self.state.lock().wallets.remove(&id))
    }

    fn set_status(&self, id: WalletId, status: WalletStatus) -> Result<Option<Wallet>> {
        let mut state = self.state.lock();
        Ok(state.wallets.get_mut(&id).map(|wallet| {
            wallet.status = status;
            wallet.version += 1;
            wallet.clone()
        }))
    }

    fn replace_pin_hash(&self, id: WalletId, pin_hash: &str) -> Result<bool> {
        let mut state = self.state.lock();
        match state.wallets.get_mut(&id) {
            Some(wallet) => {
                wallet.pin_hash = pin_hash.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn commit(
        &self,
        updates: &[BalanceUpdate],
        transfers: &[NewTransfer],
    ) -> Result<Vec<TransferRecord>> {
        let mut state = self.state.lock();

        // Validate everything first so a failure leaves no trace.
        for update in updates {
            match state.wallets.get(&update.wallet) {
                Some(w) if w.version == update.expected_version => {}
                Some(_) | None => {
                    return Err(WalletError::ConcurrencyConflict(format!(
                        "wallet {} changed since it was read",
                        update.wallet
                    )))
                }
            }
            if update.new_balance < 0 {
                return Err(WalletError::StorageFailure(format!(
                    "refusing negative balance for wallet {}",
                    update.wallet
                )));
            }
        }

        for update in updates {
            if let Some(wallet) = state.wallets.get_mut(&update.wallet) {
                wallet.balance = update.new_balance;
                wallet.version += 1;
            }
        }

        let timestamp = Utc::now();
        let mut records = Vec::with_capacity(transfers.len());
        for transfer in transfers {
            state.next_transfer_id += 1;
            let record = TransferRecord {
                id: state.next_transfer_id,
                from_wallet: transfer.from_wallet,
                to_wallet: transfer.to_wallet,
                amount: transfer.amount,
                timestamp,
            };
            state.transfers.push(record.clone());
            records.push(record);
        }

        Ok(records)
    }

    fn transfers_for(&self, id: WalletId, limit: u64) -> Result<Vec<TransferRecord>> {
        Ok(self
            .state
            .lock()
            .transfers
            .iter()
            .rev()
            .filter(|t| t.to_wallet == id || t.from_wallet == Some(id))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends() -> Vec<(&'static str, Box<dyn Persistence>)> {
        let sqlite: Box<dyn Persistence> = Box::new(Database::open(":memory:").unwrap());
        let memory: Box<dyn Persistence> = Box::new(InMemoryPersistence::new());
        vec![("sqlite", sqlite), ("memory", memory)]
    }

    #[test]
    fn test_database_open() {
        let db = Database::open(":memory:").unwrap();
        assert!(db.conn.lock().unwrap().is_autocommit());
    }

    #[test]
    fn test_insert_and_load_wallet() {
        for (name, store) in backends() {
            let created = store.insert_wallet(42, "$argon2id$stub").unwrap();
            let loaded = store.load_wallet(created.id).unwrap().expect(name);
            assert_eq!(loaded.owner_id, 42, "{name}");
            assert_eq!(loaded.balance, 0, "{name}");
            assert_eq!(loaded.status, WalletStatus::Active, "{name}");
            assert_eq!(loaded.pin_hash, "$argon2id$stub", "{name}");
            assert!(store.load_wallet(WalletId(999)).unwrap().is_none(), "{name}");
        }
    }

    #[test]
    fn test_commit_applies_updates_and_records_together() {
        for (name, store) in backends() {
            let a = store.insert_wallet(1, "h").unwrap();
            let b = store.insert_wallet(2, "h").unwrap();

            let records = store
                .commit(
                    &[
                        BalanceUpdate {
                            wallet: a.id,
                            expected_version: 0,
                            new_balance: 500,
                        },
                        BalanceUpdate {
                            wallet: b.id,
                            expected_version: 0,
                            new_balance: 700,
                        },
                    ],
                    &[NewTransfer {
                        from_wallet: Some(a.id),
                        to_wallet: b.id,
                        amount: 700,
                    }],
                )
                .unwrap();
            assert_eq!(records.len(), 1, "{name}");

            let a = store.load_wallet(a.id).unwrap().unwrap();
            let b = store.load_wallet(b.id).unwrap().unwrap();
            assert_eq!((a.balance, a.version), (500, 1), "{name}");
            assert_eq!((b.balance, b.version), (700, 1), "{name}");
            assert_eq!(store.transfers_for(a.id, 10).unwrap().len(), 1, "{name}");
            assert_eq!(store.transfers_for(b.id, 10).unwrap().len(), 1, "{name}");
        }
    }

    #[test]
    fn test_stale_version_rolls_back_whole_commit() {
        for (name, store) in backends() {
            let a = store.insert_wallet(1, "h").unwrap();
            let b = store.insert_wallet(2, "h").unwrap();

            let err = store
                .commit(
                    &[
                        BalanceUpdate {
                            wallet: a.id,
                            expected_version: 0,
                            new_balance: 100,
                        },
                        BalanceUpdate {
                            wallet: b.id,
                            expected_version: 5,
                            new_balance: 100,
                        },
                    ],
                    &[NewTransfer {
                        from_wallet: None,
                        to_wallet: a.id,
                        amount: 100,
                    }],
                )
                .unwrap_err();
            assert!(err.is_retryable(), "{name}");

            let a = store.load_wallet(a.id).unwrap().unwrap();
            assert_eq!((a.balance, a.version), (0, 0), "{name}");
            assert!(store.transfers_for(a.id, 10).unwrap().is_empty(), "{name}");
        }
    }

    #[test]
    fn test_status_pin_hash_list_and_delete() {
        for (name, store) in backends() {
            let a = store.insert_wallet(1, "old").unwrap();
            store.insert_wallet(2, "h").unwrap();
            store.insert_wallet(3, "h").unwrap();

            let frozen = store.set_status(a.id, WalletStatus::Frozen).unwrap().unwrap();
            assert_eq!(frozen.status, WalletStatus::Frozen, "{name}");
            assert_eq!(frozen.version, 1, "{name}");

            assert!(store.replace_pin_hash(a.id, "new").unwrap(), "{name}");
            assert_eq!(store.load_wallet(a.id).unwrap().unwrap().pin_hash, "new");

            let page = store.list_wallets(1, 5).unwrap();
            assert_eq!(page.len(), 2, "{name}");
            assert_eq!(page[0].owner_id, 2, "{name}");

            assert!(store.delete_wallet(a.id).unwrap().is_some(), "{name}");
            assert!(store.delete_wallet(a.id).unwrap().is_none(), "{name}");
            assert!(!store.replace_pin_hash(a.id, "x").unwrap(), "{name}");
            assert!(store.set_status(a.id, WalletStatus::Active).unwrap().is_none());
        }
    }

    #[test]
    fn test_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallets.db");
        let path = path.to_str().unwrap();

        let id = {
            let db = Database::open(path).unwrap();
            let w = db.insert_wallet(9, "h").unwrap();
            db.commit(
                &[BalanceUpdate {
                    wallet: w.id,
                    expected_version: 0,
                    new_balance: 1234,
                }],
                &[NewTransfer {
                    from_wallet: None,
                    to_wallet: w.id,
                    amount: 1234,
                }],
            )
            .unwrap();
            w.id
        };

        let db = Database::open(path).unwrap();
        let w = db.load_wallet(id).unwrap().unwrap();
        assert_eq!(w.balance, 1234);
        let history = db.transfers_for(id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_wallet, None);
    }
}
