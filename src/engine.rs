//! Transfer engine: PIN-gated deposits, transfers and batch transfers.
//!
//! Each operation runs `Received -> PinVerified -> Committed`, or ends in
//! `Rejected`. The rate guard is consulted before the PIN is looked at, and
//! the PIN is verified before any wallet lock is taken. Reservation of the
//! postings happens inside the ledger under the wallet locks.

use crate::config::{Config, EngineConfig};
use crate::error::{Result, WalletError};
use crate::ledger::{LedgerStore, Posting, TransferRecord, Wallet, WalletId};
use crate::money::Amount;
use crate::persistence::{NewTransfer, Persistence};
use crate::pin::{validate_pin_format, Argon2Custody};
use crate::rate_guard::{Bucket, RateGuard};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    PinVerified,
    Committed,
    Rejected,
}

/// Logs stage transitions for one operation.
struct Progress {
    op: &'static str,
    stage: Stage,
}

impl Progress {
    fn start(op: &'static str) -> Self {
        debug!(op, stage = ?Stage::Received, "operation received");
        Progress {
            op,
            stage: Stage::Received,
        }
    }

    fn advance(&mut self, stage: Stage) {
        debug!(op = self.op, from = ?self.stage, to = ?stage, "operation advanced");
        self.stage = stage;
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            debug!(op = self.op, at = ?self.stage, error = %err, "operation rejected");
            self.stage = Stage::Rejected;
        }
        result
    }
}

/// Bounded retry of transient conflicts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(10));
        let jitter_ms = rand::thread_rng().gen_range(0..=self.base_backoff.as_millis() as u64);
        exp + Duration::from_millis(jitter_ms)
    }
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        RetryPolicy {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// One recipient of a batch transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TransferTarget {
    #[serde(rename = "to_wallet_id")]
    pub to: WalletId,
    pub amount: Amount,
}

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub from: Wallet,
    pub to: Wallet,
    pub record: TransferRecord,
}

#[derive(Debug, Clone)]
pub struct Credit {
    pub to: Wallet,
    pub amount: Amount,
    pub record: TransferRecord,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub from: Wallet,
    pub total: Amount,
    pub credited: Vec<Credit>,
}

pub struct TransferEngine {
    ledger: Arc<LedgerStore>,
    guard: Arc<RateGuard>,
    retry: RetryPolicy,
}

impl TransferEngine {
    pub fn new(ledger: Arc<LedgerStore>, guard: Arc<RateGuard>, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            guard,
            retry,
        }
    }

    /// Wire a ledger, custody and rate guard over `persistence` using the
    /// loaded configuration.
    pub fn from_config(config: &Config, persistence: Arc<dyn Persistence>) -> Result<Self> {
        let custody = Argon2Custody::new(&config.pin)?;
        let ledger = LedgerStore::new(
            persistence,
            Arc::new(custody),
            Duration::from_millis(config.engine.lock_timeout_ms),
        );
        let guard = RateGuard::new(config.rate_limit.clone());
        Ok(Self::new(
            Arc::new(ledger),
            Arc::new(guard),
            RetryPolicy::from(&config.engine),
        ))
    }

    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    pub fn guard(&self) -> &Arc<RateGuard> {
        &self.guard
    }

    /// Rate-guarded PIN check with no balance change.
    pub fn verify_pin(&self, caller: &str, wallet_id: WalletId, pin: &str) -> Result<()> {
        let mut progress = Progress::start("verify_pin");
        let result = self.authenticate(caller, wallet_id, pin, Bucket::PinVerify).map(|_| ());
        if result.is_ok() {
            progress.advance(Stage::PinVerified);
        }
        progress.track(result)
    }

    pub fn deposit(
        &self,
        caller: &str,
        wallet_id: WalletId,
        amount: Amount,
        pin: &str,
    ) -> Result<Wallet> {
        let mut progress = Progress::start("deposit");
        let result = self.deposit_inner(&mut progress, caller, wallet_id, amount, pin);
        progress.track(result)
    }

    fn deposit_inner(
        &self,
        progress: &mut Progress,
        caller: &str,
        wallet_id: WalletId,
        amount: Amount,
        pin: &str,
    ) -> Result<Wallet> {
        self.authenticate(caller, wallet_id, pin, Bucket::PinVerify)?;
        progress.advance(Stage::PinVerified);

        let journal = [NewTransfer {
            from_wallet: None,
            to_wallet: wallet_id,
            amount: amount.minor(),
        }];
        let (wallet, _) = self.with_retry("deposit", || {
            self.ledger.atomic_mutate_journaled(
                wallet_id,
                |balance| {
                    balance.checked_add(amount.minor()).ok_or_else(|| {
                        WalletError::InvalidAmount("deposit would overflow balance".to_string())
                    })
                },
                &journal,
            )
        })?;
        progress.advance(Stage::Committed);

        info!(wallet = %wallet_id, amount = %amount, "deposit committed");
        Ok(wallet)
    }

    pub fn transfer(
        &self,
        caller: &str,
        from: WalletId,
        to: WalletId,
        amount: Amount,
        pin: &str,
    ) -> Result<TransferOutcome> {
        let mut progress = Progress::start("transfer");
        let result = self.transfer_inner(&mut progress, caller, from, to, amount, pin);
        progress.track(result)
    }

    fn transfer_inner(
        &self,
        progress: &mut Progress,
        caller: &str,
        from: WalletId,
        to: WalletId,
        amount: Amount,
        pin: &str,
    ) -> Result<TransferOutcome> {
        if from == to {
            return Err(WalletError::SelfTransferNotAllowed);
        }
        self.authenticate(caller, from, pin, Bucket::Transfer)?;
        progress.advance(Stage::PinVerified);

        let postings = [
            Posting::debit(from, amount.minor()),
            Posting::credit(to, amount.minor()),
        ];
        let journal = [NewTransfer {
            from_wallet: Some(from),
            to_wallet: to,
            amount: amount.minor(),
        }];
        let (mut wallets, mut records) =
            self.with_retry("transfer", || self.ledger.apply(&postings, &journal))?;
        progress.advance(Stage::Committed);

        let from_wallet = take_wallet(&mut wallets, from)?;
        let to_wallet = take_wallet(&mut wallets, to)?;
        let record = records
            .pop()
            .ok_or_else(|| WalletError::StorageFailure("transfer record missing".to_string()))?;

        info!(from = %from, to = %to, amount = %amount, "transfer committed");
        Ok(TransferOutcome {
            from: from_wallet,
            to: to_wallet,
            record,
        })
    }

    /// One-to-many transfer. The whole batch commits or none of it does.
    pub fn batch_transfer(
        &self,
        caller: &str,
        from: WalletId,
        targets: &[TransferTarget],
        pin: &str,
    ) -> Result<BatchOutcome> {
        let mut progress = Progress::start("batch_transfer");
        let result = self.batch_inner(&mut progress, caller, from, targets, pin);
        progress.track(result)
    }

    fn batch_inner(
        &self,
        progress: &mut Progress,
        caller: &str,
        from: WalletId,
        targets: &[TransferTarget],
        pin: &str,
    ) -> Result<BatchOutcome> {
        if targets.is_empty() {
            return Err(WalletError::InvalidAmount(
                "batch must contain at least one transfer".to_string(),
            ));
        }
        if targets.iter().any(|t| t.to == from) {
            return Err(WalletError::SelfTransferNotAllowed);
        }
        let total = Amount::sum(targets.iter().map(|t| t.amount))?;
        self.authenticate(caller, from, pin, Bucket::Transfer)?;
        progress.advance(Stage::PinVerified);

        let mut postings = Vec::with_capacity(targets.len() + 1);
        postings.push(Posting::debit(from, total.minor()));
        postings.extend(targets.iter().map(|t| Posting::credit(t.to, t.amount.minor())));

        let journal: Vec<NewTransfer> = targets
            .iter()
            .map(|t| NewTransfer {
                from_wallet: Some(from),
                to_wallet: t.to,
                amount: t.amount.minor(),
            })
            .collect();

        let (mut wallets, records) =
            self.with_retry("batch_transfer", || self.ledger.apply(&postings, &journal))?;
        progress.advance(Stage::Committed);

        let from_wallet = take_wallet(&mut wallets, from)?;
        let mut credited = Vec::with_capacity(targets.len());
        for (target, record) in targets.iter().zip(records) {
            let to = wallets
                .iter()
                .find(|w| w.id == target.to)
                .cloned()
                .ok_or(WalletError::WalletNotFound(target.to))?;
            credited.push(Credit {
                to,
                amount: target.amount,
                record,
            });
        }

        info!(from = %from, legs = credited.len(), total = %total, "batch transfer committed");
        Ok(BatchOutcome {
            from: from_wallet,
            total,
            credited,
        })
    }

    /// Rate guard, then PIN. Upgrades weak credentials after a match.
    ///
    /// Each attempt is charged to exactly one bucket: `Transfer` for
    /// transfers and batches, `PinVerify` for everything else.
    fn authenticate(
        &self,
        caller: &str,
        wallet_id: WalletId,
        pin: &str,
        bucket: Bucket,
    ) -> Result<Wallet> {
        validate_pin_format(pin)?;
        self.guard.check(caller, bucket)?;

        let wallet = self.ledger.get(wallet_id)?;
        let custody = self.ledger.custody();
        if !custody.verify(pin, &wallet.pin_hash) {
            warn!(wallet = %wallet_id, caller = %caller, "incorrect PIN");
            return Err(WalletError::IncorrectPin);
        }

        if custody.needs_upgrade(&wallet.pin_hash) {
            match custody
                .hash(pin)
                .and_then(|fresh| self.ledger.replace_pin_hash(wallet_id, &fresh))
            {
                Ok(()) => info!(wallet = %wallet_id, "PIN credential upgraded"),
                Err(e) => warn!(wallet = %wallet_id, error = %e, "PIN credential upgrade failed"),
            }
        }

        Ok(wallet)
    }

    fn with_retry<T, F>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match f() {
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let wait = self.retry.backoff(attempt);
                    warn!(op, attempt, wait_ms = wait.as_millis() as u64, error = %err, "retrying after conflict");
                    std::thread::sleep(wait);
                }
                other => return other,
            }
        }
    }
}

fn take_wallet(wallets: &mut Vec<Wallet>, id: WalletId) -> Result<Wallet> {
    let index = wallets
        .iter()
        .position(|w| w.id == id)
        .ok_or(WalletError::WalletNotFound(id))?;
    Ok(wallets.swap_remove(index))
}
