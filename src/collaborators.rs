//! The three collaborators spec.md's OUT OF SCOPE section assumes: a
//! wallet/coin-selector, a broadcaster, and a persistent per-channel store.
//! Only their interfaces live in this crate; this module also ships a
//! minimal in-memory `ChannelStore` implementation for tests and as a
//! reference for integrators.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Transaction, TxOut};
use log::debug;
use tokio::sync::RwLock;

use crate::error::Error;
use crate::store::ChannelId;

/// Coin-selection policy for funding the multisig contract.
#[derive(Debug, Clone, Copy)]
pub struct FundingPolicy {
    /// Whether unconfirmed parent outputs may be selected as inputs.
    /// Defaults to `true` (spec.md §4.1: "coin selector allows unconfirmed
    /// by default; overridable").
    pub allow_unconfirmed: bool,
}

impl Default for FundingPolicy {
    fn default() -> Self {
        FundingPolicy {
            allow_unconfirmed: true,
        }
    }
}

/// The result of asking the wallet to complete a partially built
/// transaction around a target output.
#[derive(Debug, Clone)]
pub struct FundedTransaction {
    pub transaction: Transaction,
    pub fee_paid: bitcoin::Amount,
}

/// The wallet/UTXO/coin-selector subsystem this crate treats as a black
/// box (spec.md, OUT OF SCOPE).
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Funds a transaction carrying `target_output` as its first output,
    /// selecting additional inputs (and an optional change output) under
    /// `policy`. The multisig output is never reordered (spec.md §4.1:
    /// "multisig-first convention").
    async fn fund_output(
        &self,
        target_output: TxOut,
        policy: FundingPolicy,
        password: Option<&str>,
    ) -> Result<FundedTransaction, Error>;

    /// Hands a fully signed transaction to the wallet to commit to its
    /// local UTXO view (does not itself broadcast).
    async fn commit_transaction(&self, tx: Transaction) -> Result<(), Error>;
}

/// Asynchronous transaction publication (spec.md, OUT OF SCOPE).
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Submits `tx` to the network. Resolves once the broadcaster has an
    /// outcome; callers needing a timeout must impose one themselves
    /// (spec.md §5: "Broadcast futures have no built-in timeout").
    async fn broadcast(&self, tx: Transaction) -> Result<(), Error>;
}

/// Persistent mapping from channel id to its record (spec.md §2).
#[async_trait]
pub trait ChannelStore<T>: Send + Sync
where
    T: Clone + Send + Sync,
{
    async fn add(&self, id: ChannelId, record: T) -> Result<(), Error>;
    async fn update(&self, id: ChannelId, record: T) -> Result<(), Error>;
    async fn remove(&self, id: ChannelId) -> Result<(), Error>;
    async fn get(&self, id: ChannelId) -> Result<Option<T>, Error>;

    /// Registers a callback to run once `expiry_time` (absolute UNIX time)
    /// has passed for `id`. Nothing fires the callback on its own; a caller
    /// must periodically invoke [`ChannelStore::sweep_expired`] (or an
    /// equivalent driven by its own scheduler) to evaluate pending
    /// callbacks, since this crate does not spawn background timers on the
    /// caller's behalf.
    async fn on_expiry(
        &self,
        id: ChannelId,
        expiry_time: u32,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Result<(), Error>;

    /// Runs any registered expiry callbacks whose `expiry_time` is at or
    /// before `now`, removing them from the pending set.
    async fn sweep_expired(&self, now: u32);
}

struct ExpiryCallback {
    expiry_time: u32,
    callback: Box<dyn FnOnce() + Send>,
}

/// Reference `ChannelStore` implementation: an in-process map guarded by a
/// `tokio::sync::RwLock`. Suitable for tests and single-process
/// integrations; a real deployment backs this with the wallet's own
/// extension persistence (spec.md §9: "model as an injected `ChannelStore`
/// keyed by id; process-wide singletons are avoided").
pub struct InMemoryChannelStore<T> {
    records: RwLock<HashMap<ChannelId, T>>,
    expiries: RwLock<Vec<(ChannelId, ExpiryCallback)>>,
}

impl<T> InMemoryChannelStore<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryChannelStore {
            records: RwLock::new(HashMap::new()),
            expiries: RwLock::new(Vec::new()),
        })
    }
}

impl<T> Default for InMemoryChannelStore<T> {
    fn default() -> Self {
        InMemoryChannelStore {
            records: RwLock::new(HashMap::new()),
            expiries: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl<T> ChannelStore<T> for InMemoryChannelStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn add(&self, id: ChannelId, record: T) -> Result<(), Error> {
        debug!(target: "paych_core::store", "adding channel {id}");
        self.records.write().await.insert(id, record);
        Ok(())
    }

    async fn update(&self, id: ChannelId, record: T) -> Result<(), Error> {
        debug!(target: "paych_core::store", "updating channel {id}");
        self.records.write().await.insert(id, record);
        Ok(())
    }

    async fn remove(&self, id: ChannelId) -> Result<(), Error> {
        debug!(target: "paych_core::store", "removing channel {id}");
        self.records.write().await.remove(&id);
        self.expiries.write().await.retain(|(eid, _)| *eid != id);
        Ok(())
    }

    async fn get(&self, id: ChannelId) -> Result<Option<T>, Error> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn on_expiry(
        &self,
        id: ChannelId,
        expiry_time: u32,
        callback: Box<dyn FnOnce() + Send>,
    ) -> Result<(), Error> {
        self.expiries
            .write()
            .await
            .push((id, ExpiryCallback { expiry_time, callback }));
        Ok(())
    }

    async fn sweep_expired(&self, now: u32) {
        let mut due = Vec::new();
        {
            let mut expiries = self.expiries.write().await;
            let mut i = 0;
            while i < expiries.len() {
                if expiries[i].1.expiry_time <= now {
                    due.push(expiries.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for (_, cb) in due {
            (cb.callback)();
        }
    }
}
