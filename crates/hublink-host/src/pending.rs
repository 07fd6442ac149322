//! Load/unload exclusion for one physical target.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::client_id::ClientId;
use crate::error::{HostError, Result};

/// Which operation a pending transaction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Load,
    Unload,
}

/// One fragment of an app binary, ready to be sent to the hub.
///
/// App metadata is repeated in every fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFragment {
    pub transaction_id: u32,
    /// Starts at 1.
    pub fragment_id: u32,
    pub app_id: u64,
    pub app_version: u32,
    pub app_flags: u32,
    pub target_api_version: u32,
    /// Size of the whole binary.
    pub total_len: usize,
    pub data: Vec<u8>,
}

/// An app binary split into numbered fragments.
///
/// The binary is opaque bytes.
#[derive(Debug, Clone)]
pub struct FragmentedLoadTransaction {
    transaction_id: u32,
    app_id: u64,
    app_version: u32,
    app_flags: u32,
    target_api_version: u32,
    binary: Vec<u8>,
    fragment_size: usize,
    /// Id of the last fragment handed out; 0 before the first.
    current_fragment_id: u32,
}

impl FragmentedLoadTransaction {
    pub fn new(
        transaction_id: u32,
        app_id: u64,
        app_version: u32,
        app_flags: u32,
        target_api_version: u32,
        binary: Vec<u8>,
        fragment_size: usize,
    ) -> Self {
        Self {
            transaction_id,
            app_id,
            app_version,
            app_flags,
            target_api_version,
            binary,
            fragment_size: fragment_size.max(1),
            current_fragment_id: 0,
        }
    }

    pub fn transaction_id(&self) -> u32 {
        self.transaction_id
    }

    pub fn app_id(&self) -> u64 {
        self.app_id
    }

    /// Number of fragments. An empty binary still takes one.
    pub fn fragment_count(&self) -> u32 {
        let count = self.binary.len().div_ceil(self.fragment_size).max(1);
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Id of the fragment handed out last; 0 before the first.
    pub fn current_fragment_id(&self) -> u32 {
        self.current_fragment_id
    }

    pub fn is_complete(&self) -> bool {
        self.current_fragment_id >= self.fragment_count()
    }

    /// Hand out the next fragment, or `None` once all were sent.
    pub fn next_fragment(&mut self) -> Option<LoadFragment> {
        if self.is_complete() {
            return None;
        }
        let start = self.current_fragment_id as usize * self.fragment_size;
        let end = (start + self.fragment_size).min(self.binary.len());
        self.current_fragment_id += 1;
        Some(LoadFragment {
            transaction_id: self.transaction_id,
            fragment_id: self.current_fragment_id,
            app_id: self.app_id,
            app_version: self.app_version,
            app_flags: self.app_flags,
            target_api_version: self.target_api_version,
            total_len: self.binary.len(),
            data: self.binary.get(start..end).unwrap_or_default().to_vec(),
        })
    }
}

/// An in-flight load or unload.
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub transaction_id: u32,
    pub kind: TransactionKind,
    pub client_id: ClientId,
    /// Refreshed each time a load fragment is handed out.
    pub registered_at: Instant,
    load: Option<FragmentedLoadTransaction>,
}

impl PendingTransaction {
    /// The load being fragmented, for load transactions.
    pub fn load(&self) -> Option<&FragmentedLoadTransaction> {
        self.load.as_ref()
    }
}

/// At most one load or unload in flight; stale ones may be superseded.
#[derive(Debug)]
pub struct PendingOperationTracker {
    timeout: Duration,
    pending: Option<PendingTransaction>,
}

impl PendingOperationTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending(&self) -> Option<&PendingTransaction> {
        self.pending.as_ref()
    }

    /// Whether a new transaction may start at `now`.
    pub fn is_new_transaction_allowed(&self, now: Instant) -> bool {
        match &self.pending {
            None => true,
            Some(pending) => now.saturating_duration_since(pending.registered_at) >= self.timeout,
        }
    }

    pub fn register_pending_load(
        &mut self,
        client_id: ClientId,
        transaction: FragmentedLoadTransaction,
        now: Instant,
    ) -> Result<()> {
        self.register(
            client_id,
            transaction.transaction_id(),
            TransactionKind::Load,
            Some(transaction),
            now,
        )
    }

    pub fn register_pending_unload(
        &mut self,
        client_id: ClientId,
        transaction_id: u32,
        now: Instant,
    ) -> Result<()> {
        self.register(client_id, transaction_id, TransactionKind::Unload, None, now)
    }

    /// Clear the pending transaction if it is `client_id`'s `transaction_id`.
    pub fn reset_pending(&mut self, client_id: ClientId, transaction_id: u32) -> bool {
        let matches = self.pending.as_ref().is_some_and(|pending| {
            pending.client_id == client_id && pending.transaction_id == transaction_id
        });
        if matches {
            debug!(client_id, transaction_id, "pending transaction cleared");
            self.pending = None;
        } else {
            warn!(client_id, transaction_id, "no matching pending transaction to clear");
        }
        matches
    }

    /// Clear whatever is pending for `client_id`.
    pub fn reset_for_client(&mut self, client_id: ClientId) -> Option<PendingTransaction> {
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.client_id == client_id)
        {
            return self.pending.take();
        }
        None
    }

    /// Drop any pending transaction.
    pub fn clear(&mut self) -> Option<PendingTransaction> {
        self.pending.take()
    }

    /// Next fragment of `client_id`'s pending load.
    ///
    /// `current_fragment_id` is the fragment the hub just acknowledged (0 to
    /// start); it must match the last one handed out. Each fragment restarts
    /// the timeout.
    pub fn next_fragment(
        &mut self,
        client_id: ClientId,
        transaction_id: u32,
        current_fragment_id: u32,
        now: Instant,
    ) -> Option<LoadFragment> {
        let pending = self.pending.as_mut()?;
        if pending.client_id != client_id || pending.transaction_id != transaction_id {
            warn!(client_id, transaction_id, "fragment requested for a load that is not pending");
            return None;
        }
        let load = pending.load.as_mut()?;
        if load.current_fragment_id() != current_fragment_id {
            warn!(
                transaction_id,
                expected = load.current_fragment_id(),
                current_fragment_id,
                "fragment acknowledgement out of sequence"
            );
            return None;
        }
        let fragment = load.next_fragment()?;
        pending.registered_at = now;
        Some(fragment)
    }

    fn register(
        &mut self,
        client_id: ClientId,
        transaction_id: u32,
        kind: TransactionKind,
        load: Option<FragmentedLoadTransaction>,
        now: Instant,
    ) -> Result<()> {
        if !self.is_new_transaction_allowed(now) {
            if let Some(pending) = &self.pending {
                return Err(HostError::TransactionPending {
                    kind: pending.kind,
                    transaction_id: pending.transaction_id,
                    client_id: pending.client_id,
                });
            }
        }
        if let Some(stale) = &self.pending {
            warn!(
                kind = ?stale.kind,
                transaction_id = stale.transaction_id,
                client_id = stale.client_id,
                "superseding timed out transaction"
            );
        }
        debug!(?kind, client_id, transaction_id, "transaction pending");
        self.pending = Some(PendingTransaction {
            transaction_id,
            kind,
            client_id,
            registered_at: now,
            load,
        });
        Ok(())
    }
}
