//! File-transfer handshake state, requester and offeree side.
//!
//! Requester: `Requested → Uploading → Done | Failed`, or `Requested → Denied`.
//! Offeree: one pending offer per offering rank; a newer offer replaces the older one.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;

use crate::protocol::{DeliveryMode, FileId, Rank, TransferOffer, TransferReply};

/// Requester-side status of a transfer, kept after the handshake resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Requested,
    Uploading,
    Done,
    Denied,
    Failed(String),
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Done | TransferStatus::Denied | TransferStatus::Failed(_)
        )
    }
}

/// An offer we made and are waiting on, plus what the upload needs.
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    pub offer: TransferOffer,
    pub path: PathBuf,
    pub mode: DeliveryMode,
    pub target_rank: Rank,
}

/// Resolved transfers whose status is remembered.
pub const STATUS_HISTORY: usize = 256;

/// Requester side: `active_transfers` keyed by file id, plus per-transfer status.
/// Statuses of resolved transfers are kept for the last `history_cap` of them only.
#[derive(Debug)]
pub struct Outgoing {
    active: HashMap<FileId, OutgoingTransfer>,
    status: HashMap<FileId, TransferStatus>,
    resolved: VecDeque<FileId>,
    history_cap: usize,
}

impl Default for Outgoing {
    fn default() -> Self {
        Self::with_history(STATUS_HISTORY)
    }
}

impl Outgoing {
    pub fn with_history(history_cap: usize) -> Self {
        Self {
            active: HashMap::new(),
            status: HashMap::new(),
            resolved: VecDeque::new(),
            history_cap,
        }
    }

    pub fn request(&mut self, transfer: OutgoingTransfer) {
        let file_id = transfer.offer.file_id;
        self.active.insert(file_id, transfer);
        self.status.insert(file_id, TransferStatus::Requested);
    }

    /// Pop the transfer an ACK approves. `None` for unknown or already resolved ids.
    pub fn on_ack(&mut self, file_id: FileId) -> Option<OutgoingTransfer> {
        let transfer = self.active.remove(&file_id)?;
        self.status.insert(file_id, TransferStatus::Uploading);
        Some(transfer)
    }

    /// Pop and discard the transfer a DENY rejects.
    pub fn on_deny(&mut self, file_id: FileId) -> Option<OutgoingTransfer> {
        let transfer = self.active.remove(&file_id)?;
        self.resolve(file_id, TransferStatus::Denied);
        Some(transfer)
    }

    /// Drop a request that never reached its target.
    pub fn abandon(&mut self, file_id: FileId, reason: impl Into<String>) -> Option<OutgoingTransfer> {
        let transfer = self.active.remove(&file_id)?;
        self.resolve(file_id, TransferStatus::Failed(reason.into()));
        Some(transfer)
    }

    /// Record how an upload ended. Only an `Uploading` transfer can finish.
    pub fn finish(&mut self, file_id: FileId, outcome: Result<(), String>) {
        if self.status.get(&file_id) != Some(&TransferStatus::Uploading) {
            return;
        }
        let status = match outcome {
            Ok(()) => TransferStatus::Done,
            Err(reason) => TransferStatus::Failed(reason),
        };
        self.resolve(file_id, status);
    }

    fn resolve(&mut self, file_id: FileId, status: TransferStatus) {
        self.status.insert(file_id, status);
        self.resolved.push_back(file_id);
        while self.resolved.len() > self.history_cap {
            if let Some(oldest) = self.resolved.pop_front() {
                self.status.remove(&oldest);
            }
        }
    }

    pub fn status(&self, file_id: FileId) -> Option<TransferStatus> {
        self.status.get(&file_id).cloned()
    }

    pub fn is_active(&self, file_id: FileId) -> bool {
        self.active.contains_key(&file_id)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }
}

/// Offeree side: `pending_offers` keyed by offering rank.
#[derive(Debug, Default)]
pub struct Incoming {
    pending: BTreeMap<Rank, TransferOffer>,
}

impl Incoming {
    /// Store an offer. Returns the unresolved offer it replaced, if any.
    pub fn offer(&mut self, offer: TransferOffer) -> Option<TransferOffer> {
        self.pending.insert(offer.from_rank, offer)
    }

    pub fn take(&mut self, from_rank: Rank) -> Option<TransferOffer> {
        self.pending.remove(&from_rank)
    }

    pub fn get(&self, from_rank: Rank) -> Option<&TransferOffer> {
        self.pending.get(&from_rank)
    }

    pub fn pending(&self) -> Vec<TransferOffer> {
        self.pending.values().cloned().collect()
    }
}

/// ACK/DENY body for an offer: echoes the file id back to the offering identity.
pub fn reply_for(offer: &TransferOffer) -> TransferReply {
    TransferReply {
        file_id: offer.file_id,
        to: offer.from.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn offer(from_rank: Rank, filename: &str) -> TransferOffer {
        TransferOffer {
            file_id: Uuid::new_v4(),
            filename: filename.into(),
            size: 10,
            from: format!("user_{}", from_rank),
            to: "user_9".into(),
            from_rank,
        }
    }

    fn outgoing(o: TransferOffer) -> OutgoingTransfer {
        OutgoingTransfer {
            offer: o,
            path: PathBuf::from("/tmp/x"),
            mode: DeliveryMode::Relay,
            target_rank: 9,
        }
    }

    #[test]
    fn ack_pops_exactly_once() {
        let mut out = Outgoing::default();
        let o = offer(1, "a.txt");
        let id = o.file_id;
        out.request(outgoing(o));
        assert_eq!(out.status(id), Some(TransferStatus::Requested));
        assert!(out.on_ack(id).is_some());
        assert!(!out.is_active(id));
        assert_eq!(out.status(id), Some(TransferStatus::Uploading));
        assert!(out.on_ack(id).is_none());
        assert!(out.on_deny(id).is_none());
        assert_eq!(out.status(id), Some(TransferStatus::Uploading));
        out.finish(id, Ok(()));
        assert_eq!(out.status(id), Some(TransferStatus::Done));
        out.finish(id, Err("late".into()));
        assert_eq!(out.status(id), Some(TransferStatus::Done));
    }

    #[test]
    fn deny_discards() {
        let mut out = Outgoing::default();
        let o = offer(1, "a.txt");
        let id = o.file_id;
        out.request(outgoing(o));
        assert!(out.on_deny(id).is_some());
        assert_eq!(out.status(id), Some(TransferStatus::Denied));
        assert!(out.on_ack(id).is_none());
        assert_eq!(out.active_len(), 0);
    }

    #[test]
    fn resolved_history_is_bounded() {
        let mut out = Outgoing::with_history(2);
        let ids: Vec<FileId> = (0..4)
            .map(|i| {
                let o = offer(1, &format!("{}.txt", i));
                let id = o.file_id;
                out.request(outgoing(o));
                id
            })
            .collect();
        out.on_deny(ids[0]);
        out.on_ack(ids[1]);
        out.finish(ids[1], Ok(()));
        out.abandon(ids[2], "unreachable");
        assert!(out.status(ids[0]).is_none());
        assert_eq!(out.status(ids[1]), Some(TransferStatus::Done));
        assert_eq!(out.status(ids[2]), Some(TransferStatus::Failed("unreachable".into())));
        // Unresolved transfers never age out.
        assert_eq!(out.status(ids[3]), Some(TransferStatus::Requested));
        assert!(out.is_active(ids[3]));
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut out = Outgoing::default();
        assert!(out.on_ack(Uuid::new_v4()).is_none());
        assert!(out.on_deny(Uuid::new_v4()).is_none());
        out.finish(Uuid::new_v4(), Ok(()));
    }

    #[test]
    fn last_offer_from_a_rank_wins() {
        let mut inc = Incoming::default();
        let first = offer(2, "one.txt");
        let second = offer(2, "two.txt");
        assert!(inc.offer(first.clone()).is_none());
        assert_eq!(inc.offer(second.clone()), Some(first));
        inc.offer(offer(3, "three.txt"));
        assert_eq!(inc.pending().len(), 2);
        assert_eq!(inc.take(2), Some(second));
        assert!(inc.take(2).is_none());
    }

    #[test]
    fn reply_targets_offering_identity() {
        let o = offer(4, "a");
        let reply = reply_for(&o);
        assert_eq!(reply.file_id, o.file_id);
        assert_eq!(reply.to, "user_4");
    }
}
