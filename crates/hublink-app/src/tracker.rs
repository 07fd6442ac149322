//! Per (endpoint, command) request bookkeeping.
//!
//! Slot state lives in an arena indexed by `(handle, command)` rather than
//! inside endpoint descriptors, so it can be cleared wholesale on reset and
//! dropped per endpoint on unregistration.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::header::Handle;

/// Per-slot sequence number correlating a request with its response.
pub type TransactionId = u8;

/// A request this side sent and may still be waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutgoingRequestState {
    pub transaction: TransactionId,
    pub sent_at: Option<Instant>,
    /// `None` while pending means the request never times out.
    pub deadline: Option<Instant>,
    pub pending: bool,
}

/// A request this side received and is servicing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IncomingRequestState {
    pub transaction: TransactionId,
    pub received_at: Option<Instant>,
    pub open: bool,
}

/// Result of correlating an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMatch {
    /// The response answers the pending request; the slot is now idle.
    Matched { latency: Duration },
    /// A request is pending but under another transaction id.
    Mismatch { expected: TransactionId },
    /// Nothing is pending on the slot.
    NotPending,
}

/// A pending request whose deadline passed. Already cleared from the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiredRequest {
    pub handle: Handle,
    pub command: u16,
    pub transaction: TransactionId,
    pub sent_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct SlotState {
    handle: Handle,
    command: u16,
    next_transaction: TransactionId,
    outgoing: OutgoingRequestState,
    incoming: IncomingRequestState,
}

/// Arena of request slots.
#[derive(Debug, Default)]
pub struct TransactionTracker {
    slots: Vec<SlotState>,
    index: HashMap<(Handle, u16), usize>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a request as sent on `(handle, command)`.
    ///
    /// Fails with [`AppError::Busy`] when the slot already has a pending
    /// request; the existing request is left untouched.
    pub fn begin_request(
        &mut self,
        handle: Handle,
        command: u16,
        timeout: Option<Duration>,
        now: Instant,
    ) -> Result<TransactionId> {
        let slot = self.slot_mut(handle, command);
        if slot.outgoing.pending {
            return Err(AppError::Busy {
                handle,
                command,
                transaction: slot.outgoing.transaction,
            });
        }

        let transaction = slot.next_transaction;
        slot.next_transaction = slot.next_transaction.wrapping_add(1);
        slot.outgoing = OutgoingRequestState {
            transaction,
            sent_at: Some(now),
            deadline: timeout.and_then(|timeout| now.checked_add(timeout)),
            pending: true,
        };
        Ok(transaction)
    }

    /// Undo [`begin_request`](Self::begin_request) after the transport refused
    /// the datagram.
    ///
    /// Returns `false` when the request was no longer pending (it already
    /// completed, e.g. through a timeout).
    pub fn abort_request(&mut self, handle: Handle, command: u16, transaction: TransactionId) -> bool {
        match self.slot_of_mut(handle, command) {
            Some(slot) if slot.outgoing.pending && slot.outgoing.transaction == transaction => {
                slot.outgoing.pending = false;
                slot.outgoing.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Expire one pending request ahead of the periodic scan.
    ///
    /// `None` if the slot no longer holds `transaction`.
    pub fn expire_request(
        &mut self,
        handle: Handle,
        command: u16,
        transaction: TransactionId,
    ) -> Option<ExpiredRequest> {
        let slot = self.slot_of_mut(handle, command)?;
        let outgoing = &mut slot.outgoing;
        if !outgoing.pending || outgoing.transaction != transaction {
            return None;
        }
        outgoing.pending = false;
        outgoing.deadline = None;
        Some(ExpiredRequest {
            handle,
            command,
            transaction,
            sent_at: outgoing.sent_at,
        })
    }

    /// Correlate an inbound response with the pending request.
    ///
    /// Only a matching transaction id frees the slot; anything else leaves
    /// the tracker untouched.
    pub fn complete_request(
        &mut self,
        handle: Handle,
        command: u16,
        transaction: TransactionId,
        now: Instant,
    ) -> ResponseMatch {
        let Some(slot) = self.slot_of_mut(handle, command) else {
            return ResponseMatch::NotPending;
        };
        if !slot.outgoing.pending {
            return ResponseMatch::NotPending;
        }
        if slot.outgoing.transaction != transaction {
            return ResponseMatch::Mismatch {
                expected: slot.outgoing.transaction,
            };
        }

        slot.outgoing.pending = false;
        slot.outgoing.deadline = None;
        let latency = slot
            .outgoing
            .sent_at
            .map(|sent_at| now.saturating_duration_since(sent_at))
            .unwrap_or_default();
        ResponseMatch::Matched { latency }
    }

    /// Clear and return every pending request whose deadline is at or
    /// before `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<ExpiredRequest> {
        let mut expired = Vec::new();
        for slot in &mut self.slots {
            let outgoing = &mut slot.outgoing;
            let due = outgoing.pending && outgoing.deadline.is_some_and(|deadline| deadline <= now);
            if !due {
                continue;
            }
            outgoing.pending = false;
            outgoing.deadline = None;
            expired.push(ExpiredRequest {
                handle: slot.handle,
                command: slot.command,
                transaction: outgoing.transaction,
                sent_at: outgoing.sent_at,
            });
        }
        expired
    }

    /// Earliest deadline among pending requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter(|slot| slot.outgoing.pending)
            .filter_map(|slot| slot.outgoing.deadline)
            .min()
    }

    pub fn is_pending(&self, handle: Handle, command: u16) -> bool {
        self.outgoing(handle, command)
            .is_some_and(|outgoing| outgoing.pending)
    }

    pub fn outgoing(&self, handle: Handle, command: u16) -> Option<&OutgoingRequestState> {
        self.slot_of(handle, command).map(|slot| &slot.outgoing)
    }

    pub fn incoming(&self, handle: Handle, command: u16) -> Option<&IncomingRequestState> {
        self.slot_of(handle, command).map(|slot| &slot.incoming)
    }

    /// Number of pending outgoing requests.
    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.outgoing.pending)
            .count()
    }

    /// Record an inbound request being serviced.
    pub fn open_incoming(
        &mut self,
        handle: Handle,
        command: u16,
        transaction: TransactionId,
        now: Instant,
    ) {
        let slot = self.slot_mut(handle, command);
        if slot.incoming.open {
            warn!(
                handle,
                command,
                unanswered = slot.incoming.transaction,
                transaction,
                "new request replaces one that was never answered"
            );
        }
        slot.incoming = IncomingRequestState {
            transaction,
            received_at: Some(now),
            open: true,
        };
    }

    /// Close an inbound request once its response is sent.
    ///
    /// Returns the service latency when the transaction was open.
    pub fn close_incoming(
        &mut self,
        handle: Handle,
        command: u16,
        transaction: TransactionId,
        now: Instant,
    ) -> Option<Duration> {
        let slot = self.slot_of_mut(handle, command)?;
        if !slot.incoming.open || slot.incoming.transaction != transaction {
            return None;
        }
        slot.incoming.open = false;
        let latency = slot
            .incoming
            .received_at
            .map(|received_at| now.saturating_duration_since(received_at))
            .unwrap_or_default();
        debug!(handle, command, transaction, ?latency, "request serviced");
        Some(latency)
    }

    /// Drop every slot. Transaction counters restart from zero.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }

    /// Drop every slot belonging to `handle`.
    pub fn remove_endpoint(&mut self, handle: Handle) {
        self.slots.retain(|slot| slot.handle != handle);
        self.index = self
            .slots
            .iter()
            .enumerate()
            .map(|(idx, slot)| ((slot.handle, slot.command), idx))
            .collect();
    }

    fn slot_of(&self, handle: Handle, command: u16) -> Option<&SlotState> {
        self.index
            .get(&(handle, command))
            .map(|&idx| &self.slots[idx])
    }

    fn slot_of_mut(&mut self, handle: Handle, command: u16) -> Option<&mut SlotState> {
        let idx = *self.index.get(&(handle, command))?;
        Some(&mut self.slots[idx])
    }

    fn slot_mut(&mut self, handle: Handle, command: u16) -> &mut SlotState {
        let idx = match self.index.get(&(handle, command)) {
            Some(&idx) => idx,
            None => {
                self.slots.push(SlotState {
                    handle,
                    command,
                    ..SlotState::default()
                });
                let idx = self.slots.len() - 1;
                self.index.insert((handle, command), idx);
                idx
            }
        };
        &mut self.slots[idx]
    }
}
