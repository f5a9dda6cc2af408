//! Rank-addressed transport contract, the mailbox concrete transports queue into,
//! and an in-process group used by tests and single-process runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::protocol::{Envelope, Payload, Rank, Tag};
use crate::wire::{self, FrameDecodeError, FrameEncodeError};

/// Step used by the default `wait` when a transport can only probe.
const PROBE_STEP: Duration = Duration::from_millis(10);

/// Point-to-point delivery addressed by (rank, tag). Per (sender, receiver) pair,
/// records arrive in send order.
pub trait Transport: Send + Sync {
    fn local_rank(&self) -> Rank;

    /// Fire-and-forget send. Failure surfaces as an error to the caller.
    fn send(&self, payload: Payload, dest: Rank, tag: Tag) -> Result<(), TransportError>;

    /// Block until a record is available.
    fn receive(&self) -> Result<Envelope, TransportError>;

    /// Non-blocking: is something pending?
    fn probe(&self) -> bool;

    /// Block up to `timeout` for pending data. True when a `receive` would return at once:
    /// a record is pending or the transport is closed.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.probe() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(PROBE_STEP.min(deadline - now));
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("rank {0} is unreachable")]
    Unreachable(Rank),
    #[error("link to rank {0} failed")]
    LinkFailed(Rank),
    #[error("transport closed")]
    Closed,
    #[error("frame encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("frame decode error: {0}")]
    Decode(#[from] FrameDecodeError),
}

pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Inbound queue for one rank. Receivers block on a condition variable instead of polling.
#[derive(Default)]
pub struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, envelope: Envelope) {
        lock(&self.queue).push_back(envelope);
        self.ready.notify_all();
    }

    /// Blocking pop. Fails with `Closed` once the mailbox is closed and drained.
    pub fn pop(&self) -> Result<Envelope, TransportError> {
        let mut queue = lock(&self.queue);
        loop {
            if let Some(env) = queue.pop_front() {
                return Ok(env);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            queue = self
                .ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Wait up to `timeout` for a record. True if one is pending or the mailbox is closed,
    /// so a following `pop` never blocks.
    pub fn wait(&self, timeout: Duration) -> bool {
        let queue = lock(&self.queue);
        let (queue, _) = self
            .ready
            .wait_timeout_while(queue, timeout, |q| {
                q.is_empty() && !self.closed.load(Ordering::Acquire)
            })
            .unwrap_or_else(PoisonError::into_inner);
        !queue.is_empty() || self.closed.load(Ordering::Acquire)
    }

    /// Wake every blocked receiver; later pops fail once the queue drains.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = lock(&self.queue);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Injected failure on a directed link (sender → receiver).
#[derive(Debug, Clone, Copy)]
enum LinkFault {
    Down,
    /// Allow this many more sends, then fail.
    DownAfter(u64),
}

struct GroupShared {
    mailboxes: Vec<Mailbox>,
    faults: Mutex<HashMap<(Rank, Rank), LinkFault>>,
    deliveries: Mutex<HashMap<(Rank, Rank, Tag), u64>>,
}

/// In-process process group of `size` ranks. Every send crosses the wire codec,
/// so receivers never share memory with senders.
#[derive(Clone)]
pub struct LocalGroup {
    shared: Arc<GroupShared>,
}

impl LocalGroup {
    pub fn new(size: usize) -> Self {
        Self {
            shared: Arc::new(GroupShared {
                mailboxes: (0..size).map(|_| Mailbox::new()).collect(),
                faults: Mutex::new(HashMap::new()),
                deliveries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.mailboxes.len()
    }

    /// Transport handle for `rank`.
    pub fn endpoint(&self, rank: Rank) -> LocalTransport {
        LocalTransport {
            rank,
            shared: self.shared.clone(),
        }
    }

    /// Every send from `from` to `to` fails from now on.
    pub fn sever(&self, from: Rank, to: Rank) {
        lock(&self.shared.faults).insert((from, to), LinkFault::Down);
    }

    /// The next `sends` sends from `from` to `to` succeed, then the link fails.
    pub fn sever_after(&self, from: Rank, to: Rank, sends: u64) {
        lock(&self.shared.faults).insert((from, to), LinkFault::DownAfter(sends));
    }

    pub fn restore(&self, from: Rank, to: Rank) {
        lock(&self.shared.faults).remove(&(from, to));
    }

    /// Records delivered from `from` to `to` under `tag` so far.
    pub fn deliveries(&self, from: Rank, to: Rank, tag: Tag) -> u64 {
        lock(&self.shared.deliveries)
            .get(&(from, to, tag))
            .copied()
            .unwrap_or(0)
    }

    /// Records delivered under `tag` over every link.
    pub fn total_deliveries(&self, tag: Tag) -> u64 {
        lock(&self.shared.deliveries)
            .iter()
            .filter(|((_, _, t), _)| *t == tag)
            .map(|(_, n)| *n)
            .sum()
    }
}

/// One rank's view of a `LocalGroup`.
#[derive(Clone)]
pub struct LocalTransport {
    rank: Rank,
    shared: Arc<GroupShared>,
}

impl LocalTransport {
    fn mailbox(&self) -> Result<&Mailbox, TransportError> {
        self.shared
            .mailboxes
            .get(self.rank as usize)
            .ok_or(TransportError::Closed)
    }

    fn check_link(&self, dest: Rank) -> Result<(), TransportError> {
        let key = (self.rank, dest);
        let mut faults = lock(&self.shared.faults);
        match faults.get(&key).copied() {
            None => Ok(()),
            Some(LinkFault::Down) => Err(TransportError::LinkFailed(dest)),
            Some(LinkFault::DownAfter(0)) => {
                faults.insert(key, LinkFault::Down);
                Err(TransportError::LinkFailed(dest))
            }
            Some(LinkFault::DownAfter(n)) => {
                faults.insert(key, LinkFault::DownAfter(n - 1));
                Ok(())
            }
        }
    }

    /// Close this rank's mailbox; a blocked `receive` returns `Closed`.
    pub fn close(&self) {
        if let Ok(mailbox) = self.mailbox() {
            mailbox.close();
        }
    }
}

impl Transport for LocalTransport {
    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn send(&self, payload: Payload, dest: Rank, tag: Tag) -> Result<(), TransportError> {
        let target = self
            .shared
            .mailboxes
            .get(dest as usize)
            .ok_or(TransportError::Unreachable(dest))?;
        if target.is_closed() {
            return Err(TransportError::Unreachable(dest));
        }
        self.check_link(dest)?;
        let frame = wire::encode_frame(&Envelope {
            payload,
            source: self.rank,
            tag,
        })?;
        let (envelope, _) = wire::decode_frame(&frame)?;
        target.push(envelope);
        *lock(&self.shared.deliveries)
            .entry((self.rank, dest, tag))
            .or_insert(0) += 1;
        Ok(())
    }

    fn receive(&self) -> Result<Envelope, TransportError> {
        self.mailbox()?.pop()
    }

    fn probe(&self) -> bool {
        self.mailbox().map(|m| !m.is_empty()).unwrap_or(false)
    }

    fn wait(&self, timeout: Duration) -> bool {
        self.mailbox().map(|m| m.wait(timeout)).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessage, Control, Recipient};

    fn chat(text: &str) -> Payload {
        Payload::Chat(ChatMessage::text("user_1_aaaa", Recipient::All, text))
    }

    #[test]
    fn send_then_receive_carries_source_and_tag() {
        let group = LocalGroup::new(3);
        let a = group.endpoint(1);
        let b = group.endpoint(2);
        assert!(!b.probe());
        a.send(chat("hi"), 2, Tag::Msg).unwrap();
        assert!(b.probe());
        let env = b.receive().unwrap();
        assert_eq!(env.source, 1);
        assert_eq!(env.tag, Tag::Msg);
        assert_eq!(group.deliveries(1, 2, Tag::Msg), 1);
    }

    #[test]
    fn per_pair_order_is_preserved() {
        let group = LocalGroup::new(2);
        let a = group.endpoint(0);
        let b = group.endpoint(1);
        for i in 0..20 {
            a.send(chat(&i.to_string()), 1, Tag::Msg).unwrap();
        }
        for i in 0..20 {
            match b.receive().unwrap().payload {
                Payload::Chat(m) => assert_eq!(m.content, i.to_string()),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn unknown_rank_is_unreachable() {
        let group = LocalGroup::new(2);
        let a = group.endpoint(0);
        let err = a
            .send(Payload::Control(Control::Leave), 9, Tag::Cmd)
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(9)));
    }

    #[test]
    fn severed_link_fails_after_budget() {
        let group = LocalGroup::new(2);
        let a = group.endpoint(0);
        group.sever_after(0, 1, 2);
        assert!(a.send(chat("1"), 1, Tag::Msg).is_ok());
        assert!(a.send(chat("2"), 1, Tag::Msg).is_ok());
        assert!(matches!(
            a.send(chat("3"), 1, Tag::Msg),
            Err(TransportError::LinkFailed(1))
        ));
        assert!(a.send(chat("4"), 1, Tag::Msg).is_err());
        group.restore(0, 1);
        assert!(a.send(chat("5"), 1, Tag::Msg).is_ok());
        assert_eq!(group.deliveries(0, 1, Tag::Msg), 3);
    }

    #[test]
    fn wait_times_out_then_wakes() {
        let group = LocalGroup::new(2);
        let a = group.endpoint(0);
        let b = group.endpoint(1);
        assert!(!b.wait(Duration::from_millis(20)));
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            a.send(chat("late"), 1, Tag::Msg).unwrap();
        });
        assert!(b.wait(Duration::from_secs(5)));
        sender.join().unwrap();
    }

    #[test]
    fn closed_mailbox_unblocks_receive() {
        let group = LocalGroup::new(1);
        let a = group.endpoint(0);
        let closer = a.clone();
        let handle = std::thread::spawn(move || a.receive());
        std::thread::sleep(Duration::from_millis(20));
        closer.close();
        assert!(closer.wait(Duration::from_secs(5)));
        assert!(matches!(
            handle.join().unwrap(),
            Err(TransportError::Closed)
        ));
    }
}
