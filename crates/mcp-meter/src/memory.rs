//! In-memory backend backed by DashMap. Fast but lost on restart.
//!
//! Useful for embedding the pipeline without SQLite and for exercising the
//! orchestrator's partial-failure paths: debits and usage appends can be made
//! to fail on demand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::backend::{ComplianceGate, PrincipalResolver, ServerCatalog, UsageRecorder, WalletLedger};
use crate::error::{LedgerError, MeterError};
use crate::types::{ComplianceStatus, Credits, KeyRecord, UpstreamServer, UsageEvent};

#[derive(Default)]
struct Inner {
    keys: DashMap<String, KeyRecord>,
    servers: DashMap<String, UpstreamServer>,
    wallets: DashMap<String, Credits>,
    usage: Mutex<Vec<UsageEvent>>,
    fail_debits: AtomicBool,
    fail_recording: AtomicBool,
}

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a key row under its digest.
    pub fn insert_key(&self, record: KeyRecord) {
        self.inner.keys.insert(record.key_hash.clone(), record);
    }

    pub fn insert_server(&self, server: UpstreamServer) {
        self.inner.servers.insert(server.id.clone(), server);
    }

    pub fn set_compliance(&self, server_id: &str, status: ComplianceStatus) {
        if let Some(mut s) = self.inner.servers.get_mut(server_id) {
            s.compliance_status = status;
        }
    }

    pub fn set_balance(&self, user_id: &str, balance: Credits) {
        self.inner.wallets.insert(user_id.to_string(), balance);
    }

    /// Current balance, or `None` if the user has no wallet.
    pub fn wallet(&self, user_id: &str) -> Option<Credits> {
        self.inner.wallets.get(user_id).map(|b| *b)
    }

    pub fn usage_events(&self) -> Vec<UsageEvent> {
        self.inner
            .usage
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Make every subsequent debit fail with a storage error.
    pub fn fail_debits(&self, fail: bool) {
        self.inner.fail_debits.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent usage append fail.
    pub fn fail_recording(&self, fail: bool) {
        self.inner.fail_recording.store(fail, Ordering::SeqCst);
    }
}

impl PrincipalResolver for InMemoryBackend {
    async fn find_key(&self, key_digest: &str) -> Result<Option<KeyRecord>, MeterError> {
        Ok(self.inner.keys.get(key_digest).map(|r| r.clone()))
    }
}

impl ServerCatalog for InMemoryBackend {
    async fn server(&self, server_id: &str) -> Result<Option<UpstreamServer>, MeterError> {
        Ok(self.inner.servers.get(server_id).map(|s| s.clone()))
    }
}

impl ComplianceGate for InMemoryBackend {
    async fn status(&self, server_id: &str) -> Result<Option<ComplianceStatus>, MeterError> {
        Ok(self
            .inner
            .servers
            .get(server_id)
            .map(|s| s.compliance_status))
    }
}

impl WalletLedger for InMemoryBackend {
    async fn balance(&self, user_id: &str) -> Result<Credits, LedgerError> {
        self.wallet(user_id).ok_or(LedgerError::WalletNotFound)
    }

    async fn debit(&self, user_id: &str, amount: Credits) -> Result<Credits, LedgerError> {
        if self.inner.fail_debits.load(Ordering::SeqCst) {
            return Err(LedgerError::Storage("debit disabled".into()));
        }
        // get_mut holds the shard write lock, so check-and-subtract is atomic.
        let mut balance = self
            .inner
            .wallets
            .get_mut(user_id)
            .ok_or(LedgerError::WalletNotFound)?;
        if *balance < amount {
            return Err(LedgerError::InsufficientFunds);
        }
        *balance -= amount;
        Ok(*balance)
    }
}

impl UsageRecorder for InMemoryBackend {
    async fn record(&self, event: &UsageEvent) -> Result<(), MeterError> {
        if self.inner.fail_recording.load(Ordering::SeqCst) {
            return Err(MeterError::RecordingFailure("recording disabled".into()));
        }
        self.inner
            .usage
            .lock()
            .map_err(|_| MeterError::Internal("usage log lock poisoned".into()))?
            .push(event.clone());
        Ok(())
    }
}
