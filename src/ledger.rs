//! Wallet ledger store with per-wallet mutual exclusion.
//!
//! Every balance change goes through this module. A single-wallet change
//! uses [`LedgerStore::atomic_mutate`]; changes touching several wallets use
//! [`LedgerStore::apply`], which takes all involved wallet locks in ascending
//! id order, reserves every posting against the current balances and only
//! then commits them in one storage transaction.

use crate::error::{Result, WalletError};
use crate::persistence::{BalanceUpdate, NewTransfer, Persistence};
use crate::pin::PinCustody;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(pub i64);

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WalletId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(WalletId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletStatus {
    Active,
    Frozen,
    Closed,
}

impl WalletStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletStatus::Active => "active",
            WalletStatus::Frozen => "frozen",
            WalletStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WalletStatus {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(WalletStatus::Active),
            "frozen" => Ok(WalletStatus::Frozen),
            "closed" => Ok(WalletStatus::Closed),
            other => Err(WalletError::StorageFailure(format!(
                "unknown wallet status '{}'",
                other
            ))),
        }
    }
}

/// A custodial wallet. Balances are minor units.
#[derive(Clone, PartialEq, Eq)]
pub struct Wallet {
    pub id: WalletId,
    pub owner_id: i64,
    pub balance: i64,
    /// PHC credential; never the raw PIN.
    pub pin_hash: String,
    pub status: WalletStatus,
    /// Bumped on every committed balance or status change.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("balance", &self.balance)
            .field("pin_hash", &"<redacted>")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Immutable audit entry written once per credited leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    pub id: i64,
    /// `None` for deposits.
    pub from_wallet: Option<WalletId>,
    pub to_wallet: WalletId,
    pub amount: i64,
    pub timestamp: DateTime<Utc>,
}

/// One signed balance change inside a multi-wallet reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub wallet: WalletId,
    pub delta: i64,
}

impl Posting {
    pub fn debit(wallet: WalletId, minor: i64) -> Self {
        Posting {
            wallet,
            delta: -minor,
        }
    }

    pub fn credit(wallet: WalletId, minor: i64) -> Self {
        Posting {
            wallet,
            delta: minor,
        }
    }
}

pub struct LedgerStore {
    persistence: Arc<dyn Persistence>,
    custody: Arc<dyn PinCustody>,
    locks: Mutex<HashMap<WalletId, Arc<Mutex<()>>>>,
    lock_timeout: Duration,
}

impl LedgerStore {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        custody: Arc<dyn PinCustody>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            persistence,
            custody,
            locks: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    pub fn custody(&self) -> &Arc<dyn PinCustody> {
        &self.custody
    }

    /// Create a wallet with a zero balance. The PIN is hashed before
    /// anything is stored and is not kept.
    pub fn create(&self, owner_id: i64, pin: &str) -> Result<Wallet> {
        let pin_hash = self.custody.hash(pin)?;
        let wallet = self.persistence.insert_wallet(owner_id, &pin_hash)?;
        tracing::info!(wallet = %wallet.id, owner = owner_id, "wallet created");
        Ok(wallet)
    }

    pub fn get(&self, id: WalletId) -> Result<Wallet> {
        self.persistence
            .load_wallet(id)?
            .ok_or(WalletError::WalletNotFound(id))
    }

    pub fn list(&self, offset: u64, limit: u64) -> Result<Vec<Wallet>> {
        self.persistence.list_wallets(offset, limit)
    }

    /// Administrative removal; not PIN gated.
    pub fn delete(&self, id: WalletId) -> Result<Wallet> {
        let wallet = self.with_locked(&[id], || {
            self.persistence
                .delete_wallet(id)?
                .ok_or(WalletError::WalletNotFound(id))
        })?;
        tracing::info!(wallet = %id, balance = wallet.balance, "wallet deleted");
        Ok(wallet)
    }

    pub fn set_status(&self, id: WalletId, status: WalletStatus) -> Result<Wallet> {
        let wallet = self.with_locked(&[id], || {
            self.persistence
                .set_status(id, status)?
                .ok_or(WalletError::WalletNotFound(id))
        })?;
        tracing::info!(wallet = %id, status = %status, "wallet status changed");
        Ok(wallet)
    }

    /// Swap in a freshly computed credential (rehash on upgrade).
    pub fn replace_pin_hash(&self, id: WalletId, pin_hash: &str) -> Result<()> {
        if self.persistence.replace_pin_hash(id, pin_hash)? {
            Ok(())
        } else {
            Err(WalletError::WalletNotFound(id))
        }
    }

    pub fn transfers_for(&self, id: WalletId, limit: u64) -> Result<Vec<TransferRecord>> {
        self.get(id)?;
        self.persistence.transfers_for(id, limit)
    }

    /// Apply `f(current_balance) -> new_balance` under the wallet's lock.
    pub fn atomic_mutate<F>(&self, id: WalletId, f: F) -> Result<Wallet>
    where
        F: FnOnce(i64) -> Result<i64>,
    {
        self.atomic_mutate_journaled(id, f, &[]).map(|(wallet, _)| wallet)
    }

    /// [`atomic_mutate`](Self::atomic_mutate) that also appends transfer
    /// records in the same storage transaction.
    pub fn atomic_mutate_journaled<F>(
        &self,
        id: WalletId,
        f: F,
        journal: &[NewTransfer],
    ) -> Result<(Wallet, Vec<TransferRecord>)>
    where
        F: FnOnce(i64) -> Result<i64>,
    {
        self.with_locked(&[id], || {
            let mut wallet = self.load_active(id)?;
            let new_balance = f(wallet.balance)?;
            if new_balance < 0 {
                return Err(WalletError::InsufficientFunds {
                    wallet: id,
                    available: wallet.balance,
                    requested: wallet.balance.saturating_sub(new_balance),
                });
            }

            let records = self.persistence.commit(
                &[BalanceUpdate {
                    wallet: id,
                    expected_version: wallet.version,
                    new_balance,
                }],
                journal,
            )?;

            wallet.balance = new_balance;
            wallet.version += 1;
            Ok((wallet, records))
        })
    }

    /// Reserve and commit a set of postings across several wallets.
    ///
    /// Postings are checked in the order given; the first one that would
    /// hit a missing or inactive wallet, or drive a balance negative, fails
    /// the whole call and nothing is written. Returns the touched wallets
    /// in ascending id order along with the stored records.
    pub fn apply(
        &self,
        postings: &[Posting],
        journal: &[NewTransfer],
    ) -> Result<(Vec<Wallet>, Vec<TransferRecord>)> {
        let mut ids: Vec<WalletId> = postings.iter().map(|p| p.wallet).collect();
        ids.sort_unstable();
        ids.dedup();

        self.with_locked(&ids, || {
            // Reserve
            let mut reserved: HashMap<WalletId, Wallet> = HashMap::with_capacity(ids.len());
            for posting in postings {
                let wallet = match reserved.entry(posting.wallet) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => entry.insert(self.load_active(posting.wallet)?),
                };

                let next = wallet.balance.checked_add(posting.delta).ok_or_else(|| {
                    WalletError::InvalidAmount(format!(
                        "balance overflow on wallet {}",
                        posting.wallet
                    ))
                })?;
                if next < 0 {
                    return Err(WalletError::InsufficientFunds {
                        wallet: posting.wallet,
                        available: wallet.balance,
                        requested: -posting.delta,
                    });
                }
                wallet.balance = next;
            }
            tracing::debug!(wallets = ids.len(), postings = postings.len(), "postings reserved");

            // Commit
            let updates: Vec<BalanceUpdate> = ids
                .iter()
                .filter_map(|id| reserved.get(id))
                .map(|w| BalanceUpdate {
                    wallet: w.id,
                    expected_version: w.version,
                    new_balance: w.balance,
                })
                .collect();
            let records = self.persistence.commit(&updates, journal)?;

            let wallets = ids
                .iter()
                .filter_map(|id| reserved.remove(id))
                .map(|mut w| {
                    w.version += 1;
                    w
                })
                .collect();
            Ok((wallets, records))
        })
    }

    fn load_active(&self, id: WalletId) -> Result<Wallet> {
        let wallet = self.get(id)?;
        if wallet.status != WalletStatus::Active {
            return Err(WalletError::WalletInactive {
                wallet: id,
                status: wallet.status,
            });
        }
        Ok(wallet)
    }

    /// Run `f` while holding the locks of every wallet in `ids`, which must
    /// be sorted and free of duplicates.
    fn with_locked<R, F>(&self, ids: &[WalletId], f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R>,
    {
        debug_assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let handles: Vec<Arc<Mutex<()>>> = {
            let mut table = self.locks.lock();
            ids.iter()
                .map(|id| table.entry(*id).or_default().clone())
                .collect()
        };

        let result = {
            let mut guards = Vec::with_capacity(handles.len());
            let mut acquired = Ok(());
            for (id, handle) in ids.iter().zip(&handles) {
                match handle.try_lock_for(self.lock_timeout) {
                    Some(guard) => guards.push(guard),
                    None => {
                        acquired = Err(WalletError::ConcurrencyConflict(format!(
                            "timed out waiting for wallet {}",
                            id
                        )));
                        break;
                    }
                }
            }
            acquired.and_then(|()| f())
        };

        drop(handles);
        self.release_idle_locks(ids);
        result
    }

    /// Drop table entries nobody else holds a handle to. Handles are only
    /// cloned under the table lock, so a count of one is final.
    fn release_idle_locks(&self, ids: &[WalletId]) {
        let mut table = self.locks.lock();
        for id in ids {
            if table
                .get(id)
                .is_some_and(|handle| Arc::strong_count(handle) == 1)
            {
                table.remove(id);
            }
        }
    }
}

impl fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerStore")
            .field("tracked_locks", &self.locks.lock().len())
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}
