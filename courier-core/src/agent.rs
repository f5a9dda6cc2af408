//! Peer agent: presence cache, chat, and both sides of the file-transfer handshake.
//!
//! Shared state is split across independent mutexes (presence, outgoing, incoming,
//! downloads, upload handles). A thread holds at most one of them at a time and never
//! holds one across a transport send.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::error::{CourierError, Result};
use crate::handshake::{self, Incoming, Outgoing, OutgoingTransfer, TransferStatus};
use crate::presence::Presence;
use crate::protocol::{
    ChatMessage, Control, DeliveryMode, Envelope, FileId, FileMeta, Payload, Peer, Rank,
    Recipient, Tag, TransferOffer,
};
use crate::transfer::{self, ChunkOutcome, CompletedDownload, Downloads, UploadPlan, UploadReport};
use crate::transport::{lock, Transport, TransportError};

/// Default pause between chunks.
pub const DEFAULT_CHUNK_DELAY: Duration = Duration::from_millis(1);

/// Default bound on each listener wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default time a partial download may go without data before it is dropped.
pub const DEFAULT_DOWNLOAD_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub identity: String,
    pub display_name: String,
    /// Well-known rank of the directory/relay.
    pub router_rank: Rank,
    pub download_dir: PathBuf,
    pub chunk_size: u64,
    pub chunk_delay: Duration,
    pub poll_interval: Duration,
    pub download_idle_timeout: Duration,
}

impl AgentConfig {
    pub fn new(
        identity: impl Into<String>,
        display_name: impl Into<String>,
        router_rank: Rank,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            identity: identity.into(),
            display_name: display_name.into(),
            router_rank,
            download_dir: download_dir.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: DEFAULT_CHUNK_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            download_idle_timeout: DEFAULT_DOWNLOAD_IDLE_TIMEOUT,
        }
    }
}

/// Things the host should show the user.
#[derive(Debug, Clone)]
pub enum Event {
    Chat(ChatMessage),
    Presence(Vec<Peer>),
    OfferReceived {
        offer: TransferOffer,
        /// An unresolved offer from the same rank that this one replaced.
        replaced: Option<TransferOffer>,
    },
    TransferStarted {
        file_id: FileId,
        filename: String,
        mode: DeliveryMode,
    },
    TransferDelivered {
        file_id: FileId,
        filename: String,
        report: UploadReport,
    },
    TransferDenied {
        file_id: FileId,
        filename: String,
    },
    TransferFailed {
        file_id: FileId,
        filename: String,
        reason: String,
    },
    IncomingFile(FileMeta),
    DownloadComplete(CompletedDownload),
    DownloadFailed {
        filename: String,
        reason: String,
    },
}

/// What `logout` does with uploads still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Join every upload thread before returning.
    Wait,
    /// Detach them; they finish or fail on their own.
    Abandon,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: AgentConfig,
    presence: Mutex<Presence>,
    outgoing: Mutex<Outgoing>,
    incoming: Mutex<Incoming>,
    downloads: Mutex<Downloads>,
    uploads: Mutex<Vec<(FileId, JoinHandle<()>)>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    events: mpsc::UnboundedSender<Event>,
}

/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct PeerAgent {
    inner: Arc<Inner>,
}

impl PeerAgent {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: AgentConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let downloads = Downloads::new(config.download_dir.clone());
        let agent = Self {
            inner: Arc::new(Inner {
                transport,
                config,
                presence: Mutex::new(Presence::default()),
                outgoing: Mutex::new(Outgoing::default()),
                incoming: Mutex::new(Incoming::default()),
                downloads: Mutex::new(downloads),
                uploads: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
                running: AtomicBool::new(false),
                events,
            }),
        };
        (agent, rx)
    }

    pub fn rank(&self) -> Rank {
        self.inner.transport.local_rank()
    }

    pub fn identity(&self) -> &str {
        &self.inner.config.identity
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Announce ourselves to the router and start the listener thread.
    pub fn login(&self) -> Result<()> {
        let join = Control::Join {
            identity: self.inner.config.identity.clone(),
            display_name: self.inner.config.display_name.clone(),
        };
        self.inner
            .transport
            .send(Payload::Control(join), self.inner.config.router_rank, Tag::Cmd)?;
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("courier-listener-{}", self.rank()))
            .spawn(move || listen_loop(inner))?;
        *lock(&self.inner.listener) = Some(handle);
        info!(
            "logged in as {} ({}) on rank {}",
            self.inner.config.display_name,
            self.inner.config.identity,
            self.rank()
        );
        Ok(())
    }

    /// Send LEAVE, stop the listener, then wait for or abandon running uploads.
    pub fn logout(&self, policy: ShutdownPolicy) -> Result<()> {
        let leave = self.inner.transport.send(
            Payload::Control(Control::Leave),
            self.inner.config.router_rank,
            Tag::Cmd,
        );
        self.stop_listener();
        match policy {
            ShutdownPolicy::Wait => self.wait_for_uploads(),
            ShutdownPolicy::Abandon => {
                let abandoned = std::mem::take(&mut *lock(&self.inner.uploads));
                if !abandoned.is_empty() {
                    warn!("abandoning {} upload(s) in flight", abandoned.len());
                }
            }
        }
        leave.map_err(CourierError::from)
    }

    fn stop_listener(&self) {
        self.inner.running.store(false, Ordering::Release);
        let handle = lock(&self.inner.listener).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("listener thread panicked");
            }
        }
    }

    /// Ask the router to stop.
    pub fn request_shutdown(&self) -> Result<()> {
        self.inner.transport.send(
            Payload::Control(Control::Shutdown),
            self.inner.config.router_rank,
            Tag::Cmd,
        )?;
        Ok(())
    }

    /// Join every upload started so far, including ones started while waiting.
    pub fn wait_for_uploads(&self) {
        loop {
            let handles = std::mem::take(&mut *lock(&self.inner.uploads));
            if handles.is_empty() {
                return;
            }
            for (file_id, handle) in handles {
                if handle.join().is_err() {
                    warn!("upload thread for {} panicked", file_id);
                }
            }
        }
    }

    pub fn users(&self) -> Vec<Peer> {
        lock(&self.inner.presence).peers().to_vec()
    }

    pub fn pending_offers(&self) -> Vec<TransferOffer> {
        lock(&self.inner.incoming).pending()
    }

    pub fn transfer_status(&self, file_id: FileId) -> Option<TransferStatus> {
        lock(&self.inner.outgoing).status(file_id)
    }

    pub fn active_transfers(&self) -> usize {
        lock(&self.inner.outgoing).active_len()
    }

    pub fn uploads_in_flight(&self) -> usize {
        lock(&self.inner.uploads)
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .count()
    }

    /// Chat. Directed P2P messages go straight to the target's rank when the snapshot knows
    /// it, falling back to the relay on any failure; everything else goes through the relay.
    pub fn send_message(
        &self,
        content: impl Into<String>,
        to: Recipient,
        mode: DeliveryMode,
    ) -> Result<ChatMessage> {
        let msg = ChatMessage::text(self.inner.config.identity.clone(), to, content);
        if let (DeliveryMode::P2p, Recipient::Peer(identity)) = (mode, &msg.to) {
            let target = lock(&self.inner.presence)
                .by_identity(identity)
                .map(|p| p.rank);
            match target {
                Some(rank) => {
                    match self
                        .inner
                        .transport
                        .send(Payload::Chat(msg.clone()), rank, Tag::Msg)
                    {
                        Ok(()) => return Ok(msg),
                        Err(e) => warn!("direct message to rank {} failed ({}); relaying", rank, e),
                    }
                }
                None => debug!("{} not in presence snapshot; relaying", identity),
            }
        }
        self.inner.transport.send(
            Payload::Chat(msg.clone()),
            self.inner.config.router_rank,
            Tag::Msg,
        )?;
        Ok(msg)
    }

    /// Direct message addressed by rank, resolved through the presence snapshot.
    pub fn send_to_rank(
        &self,
        content: impl Into<String>,
        rank: Rank,
        mode: DeliveryMode,
    ) -> Result<ChatMessage> {
        let identity = self.identity_at(rank)?;
        self.send_message(content, Recipient::Peer(identity), mode)
    }

    fn identity_at(&self, rank: Rank) -> Result<String> {
        lock(&self.inner.presence)
            .by_rank(rank)
            .map(|p| p.identity.clone())
            .ok_or_else(|| CourierError::NotFound(format!("rank {} is not online", rank)))
    }

    /// Offer a local file to the peer at `target_rank`. The request travels the way the
    /// payload will: straight to the target in P2P mode, through the relay otherwise.
    pub fn send_file(&self, path: &Path, target_rank: Rank, mode: DeliveryMode) -> Result<FileId> {
        if !path.is_file() {
            return Err(CourierError::NotFound(format!(
                "file {} does not exist",
                path.display()
            )));
        }
        let to = self.identity_at(target_rank)?;
        let size = std::fs::metadata(path)?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CourierError::NotFound(format!("{} has no file name", path.display())))?;
        let offer = TransferOffer {
            file_id: Uuid::new_v4(),
            filename,
            size,
            from: self.inner.config.identity.clone(),
            to,
            from_rank: self.rank(),
        };
        let file_id = offer.file_id;
        lock(&self.inner.outgoing).request(OutgoingTransfer {
            offer: offer.clone(),
            path: path.to_path_buf(),
            mode,
            target_rank,
        });

        let router = self.inner.config.router_rank;
        let first_hop = match mode {
            DeliveryMode::P2p => target_rank,
            DeliveryMode::Relay => router,
        };
        let sent = match self
            .inner
            .transport
            .send(Payload::FileReq(offer.clone()), first_hop, Tag::FileReq)
        {
            Err(e) if first_hop != router => {
                warn!(
                    "direct offer to rank {} failed ({}); offering through the relay",
                    target_rank, e
                );
                self.inner
                    .transport
                    .send(Payload::FileReq(offer.clone()), router, Tag::FileReq)
            }
            other => other,
        };
        if let Err(e) = sent {
            lock(&self.inner.outgoing).abandon(file_id, e.to_string());
            return Err(e.into());
        }
        info!(
            "offered {} ({} bytes) to rank {} via {}",
            offer.filename, offer.size, target_rank, mode
        );
        Ok(file_id)
    }

    /// Accept the pending offer from `from_rank`. The ACK always goes through the relay.
    pub fn accept(&self, from_rank: Rank) -> Result<TransferOffer> {
        self.reply(from_rank, true)
    }

    /// Deny the pending offer from `from_rank`.
    pub fn deny(&self, from_rank: Rank) -> Result<TransferOffer> {
        self.reply(from_rank, false)
    }

    fn reply(&self, from_rank: Rank, accept: bool) -> Result<TransferOffer> {
        let offer = lock(&self.inner.incoming)
            .take(from_rank)
            .ok_or(CourierError::NoPendingOffer(from_rank))?;
        let reply = handshake::reply_for(&offer);
        let (payload, tag) = if accept {
            (Payload::FileAck(reply), Tag::FileAck)
        } else {
            (Payload::FileDeny(reply), Tag::FileDeny)
        };
        self.inner
            .transport
            .send(payload, self.inner.config.router_rank, tag)?;
        info!(
            "{} {} from rank {}",
            if accept { "accepted" } else { "denied" },
            offer.filename,
            from_rank
        );
        Ok(offer)
    }

    /// Dispatch one received record by tag. The listener calls this; hosts driving the
    /// transport themselves can too.
    pub fn handle_envelope(&self, envelope: Envelope) {
        let Envelope {
            payload,
            source,
            tag,
        } = envelope;
        if payload.tag() != tag {
            warn!(
                "dropping record from rank {}: tag {:?} does not match payload {:?}",
                source,
                tag,
                payload.tag()
            );
            return;
        }
        match payload {
            Payload::Chat(msg) => self.emit(Event::Chat(msg)),
            Payload::Control(Control::UserListUpdate { peers }) => self.on_presence_update(peers),
            Payload::Control(other) => debug!("ignoring {:?} from rank {}", other, source),
            Payload::FileReq(offer) => self.on_offer(offer),
            Payload::FileAck(reply) => self.on_ack(reply.file_id),
            Payload::FileDeny(reply) => self.on_deny(reply.file_id),
            Payload::FileMeta(meta) => self.on_file_meta(meta),
            Payload::FileChunk(chunk) => self.on_chunk(chunk),
        }
    }

    /// Replace the cached snapshot wholesale. Partial downloads from senders missing from
    /// it are dropped.
    pub fn on_presence_update(&self, peers: Vec<Peer>) {
        let dropped = lock(&self.inner.downloads)
            .retain_senders(|from| peers.iter().any(|p| p.identity == from));
        lock(&self.inner.presence).replace(peers.clone());
        self.emit(Event::Presence(peers));
        for filename in dropped {
            self.emit(Event::DownloadFailed {
                filename,
                reason: "sender went offline".into(),
            });
        }
    }

    fn on_offer(&self, offer: TransferOffer) {
        let replaced = lock(&self.inner.incoming).offer(offer.clone());
        if let Some(old) = &replaced {
            info!(
                "offer of {} from rank {} replaced by {}",
                old.filename, offer.from_rank, offer.filename
            );
        }
        self.emit(Event::OfferReceived { offer, replaced });
    }

    fn on_ack(&self, file_id: FileId) {
        let Some(transfer) = lock(&self.inner.outgoing).on_ack(file_id) else {
            debug!("ignoring ACK for unknown transfer {}", file_id);
            return;
        };
        let plan = UploadPlan {
            file_id,
            path: transfer.path,
            filename: transfer.offer.filename,
            from: transfer.offer.from,
            to: transfer.offer.to,
            target_rank: transfer.target_rank,
            relay_rank: self.inner.config.router_rank,
            mode: transfer.mode,
            chunk_size: self.inner.config.chunk_size,
            chunk_delay: self.inner.config.chunk_delay,
        };
        self.emit(Event::TransferStarted {
            file_id,
            filename: plan.filename.clone(),
            mode: plan.mode,
        });
        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("courier-upload-{}", file_id))
            .spawn(move || run_upload(inner, plan));
        match spawned {
            Ok(handle) => {
                let mut uploads = lock(&self.inner.uploads);
                uploads.retain(|(_, h)| !h.is_finished());
                uploads.push((file_id, handle));
            }
            Err(e) => {
                warn!("could not start upload {}: {}", file_id, e);
                lock(&self.inner.outgoing).finish(file_id, Err(e.to_string()));
            }
        }
    }

    fn on_deny(&self, file_id: FileId) {
        match lock(&self.inner.outgoing).on_deny(file_id) {
            Some(transfer) => {
                info!("offer of {} was denied", transfer.offer.filename);
                self.emit(Event::TransferDenied {
                    file_id,
                    filename: transfer.offer.filename,
                });
            }
            None => debug!("ignoring DENY for unknown transfer {}", file_id),
        }
    }

    fn on_file_meta(&self, meta: FileMeta) {
        let started = lock(&self.inner.downloads).on_meta(meta.clone());
        match started {
            Ok(_) => self.emit(Event::IncomingFile(meta)),
            Err(e) => {
                warn!("rejecting incoming {}: {}", meta.filename, e);
                self.emit(Event::DownloadFailed {
                    filename: meta.filename,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_chunk(&self, chunk: crate::protocol::Chunk) {
        let filename = chunk.filename.clone();
        let outcome = lock(&self.inner.downloads).on_chunk(chunk);
        match outcome {
            Ok(ChunkOutcome::Complete(done)) => self.emit(Event::DownloadComplete(done)),
            Ok(ChunkOutcome::AwaitingGaps { missing }) => {
                debug!("{}: waiting on {} missing chunk(s)", filename, missing)
            }
            Ok(ChunkOutcome::InProgress { .. }) => {}
            Err(e @ (CourierError::Integrity(_) | CourierError::Io(_))) => {
                warn!("download of {} failed: {}", filename, e);
                self.emit(Event::DownloadFailed {
                    filename,
                    reason: e.to_string(),
                });
            }
            Err(e) => warn!("dropping chunk of {}: {}", filename, e),
        }
    }

    fn emit(&self, event: Event) {
        self.inner.emit(event);
    }
}

impl Inner {
    fn emit(&self, event: Event) {
        // The host may have stopped listening; events are advisory.
        let _ = self.events.send(event);
    }

    fn expire_idle_downloads(&self) {
        let timeout = self.config.download_idle_timeout;
        let expired = lock(&self.downloads).expire_idle(timeout);
        for filename in expired {
            self.emit(Event::DownloadFailed {
                filename,
                reason: format!("no data for {:?}", timeout),
            });
        }
    }
}

fn listen_loop(inner: Arc<Inner>) {
    let agent = PeerAgent {
        inner: inner.clone(),
    };
    let mut last_sweep = Instant::now();
    while inner.running.load(Ordering::Acquire) {
        if last_sweep.elapsed() >= IDLE_SWEEP_INTERVAL.min(inner.config.download_idle_timeout) {
            last_sweep = Instant::now();
            inner.expire_idle_downloads();
        }
        if !inner.transport.wait(inner.config.poll_interval) {
            continue;
        }
        match inner.transport.receive() {
            Ok(envelope) => agent.handle_envelope(envelope),
            Err(TransportError::Closed) => {
                info!("transport closed; listener stopping");
                break;
            }
            Err(e) => warn!("receive failed: {}", e),
        }
    }
    debug!("listener on rank {} exited", inner.transport.local_rank());
}

fn run_upload(inner: Arc<Inner>, plan: UploadPlan) {
    let result = transfer::upload(inner.transport.as_ref(), &plan);
    let outcome = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
    lock(&inner.outgoing).finish(plan.file_id, outcome);
    match result {
        Ok(report) => {
            info!(
                "{} delivered to {} via {}{}",
                plan.filename,
                plan.to,
                report.mode,
                if report.fell_back { " after P2P failure" } else { "" }
            );
            inner.emit(Event::TransferDelivered {
                file_id: plan.file_id,
                filename: plan.filename,
                report,
            });
        }
        Err(e) => {
            warn!("upload of {} failed: {}", plan.filename, e);
            inner.emit(Event::TransferFailed {
                file_id: plan.file_id,
                filename: plan.filename,
                reason: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TransferReply;
    use crate::transport::LocalGroup;
    use std::fs::File;
    use std::io::Write;

    fn peer(rank: Rank, identity: &str) -> Peer {
        Peer {
            identity: identity.into(),
            display_name: format!("User_{}", rank),
            rank,
        }
    }

    /// Agent on rank 1 of a 3-rank group (router 0, other peer 2) with a known snapshot.
    fn setup(dir: &Path) -> (LocalGroup, PeerAgent, mpsc::UnboundedReceiver<Event>) {
        let group = LocalGroup::new(3);
        let mut config = AgentConfig::new("a", "User_1", 0, dir.join("downloads"));
        config.chunk_size = 16;
        config.chunk_delay = Duration::ZERO;
        let (agent, rx) = PeerAgent::new(Arc::new(group.endpoint(1)), config);
        agent.handle_envelope(Envelope::new(
            Payload::Control(Control::UserListUpdate {
                peers: vec![peer(1, "a"), peer(2, "b")],
            }),
            0,
        ));
        (group, agent, rx)
    }

    fn sample_file(dir: &Path, len: usize) -> PathBuf {
        let path = dir.join("notes.txt");
        let data: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
        File::create(&path).unwrap().write_all(&data).unwrap();
        path
    }

    fn drain(t: &dyn Transport) -> Vec<Envelope> {
        let mut out = Vec::new();
        while t.probe() {
            out.push(t.receive().unwrap());
        }
        out
    }

    fn reply(file_id: FileId) -> TransferReply {
        TransferReply {
            file_id,
            to: "a".into(),
        }
    }

    #[test]
    fn presence_update_replaces_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (_group, agent, mut rx) = setup(dir.path());
        assert_eq!(agent.users().len(), 2);
        agent.handle_envelope(Envelope::new(
            Payload::Control(Control::UserListUpdate {
                peers: vec![peer(1, "a")],
            }),
            0,
        ));
        assert_eq!(agent.users(), vec![peer(1, "a")]);
        assert!(matches!(rx.try_recv(), Ok(Event::Presence(_))));
    }

    #[test]
    fn broadcast_always_goes_through_relay() {
        let dir = tempfile::tempdir().unwrap();
        let (group, agent, _rx) = setup(dir.path());
        agent
            .send_message("hi all", Recipient::All, DeliveryMode::P2p)
            .unwrap();
        assert_eq!(group.deliveries(1, 0, Tag::Msg), 1);
        assert_eq!(group.deliveries(1, 2, Tag::Msg), 0);
    }

    #[test]
    fn p2p_message_goes_direct_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let (group, agent, _rx) = setup(dir.path());
        agent.send_to_rank("psst", 2, DeliveryMode::P2p).unwrap();
        assert_eq!(group.deliveries(1, 2, Tag::Msg), 1);
        assert_eq!(group.deliveries(1, 0, Tag::Msg), 0);

        group.sever(1, 2);
        agent.send_to_rank("psst again", 2, DeliveryMode::P2p).unwrap();
        assert_eq!(group.deliveries(1, 2, Tag::Msg), 1);
        assert_eq!(group.deliveries(1, 0, Tag::Msg), 1);

        agent
            .send_message("who?", Recipient::peer("stranger"), DeliveryMode::P2p)
            .unwrap();
        assert_eq!(group.deliveries(1, 0, Tag::Msg), 2);
    }

    #[test]
    fn dm_to_unknown_rank_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (group, agent, _rx) = setup(dir.path());
        let err = agent.send_to_rank("hi", 7, DeliveryMode::Relay).unwrap_err();
        assert!(matches!(err, CourierError::NotFound(_)));
        assert_eq!(group.total_deliveries(Tag::Msg), 0);
    }

    #[test]
    fn missing_file_creates_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let (group, agent, _rx) = setup(dir.path());
        let err = agent
            .send_file(&dir.path().join("nope.bin"), 2, DeliveryMode::Relay)
            .unwrap_err();
        assert!(matches!(err, CourierError::NotFound(_)));
        assert_eq!(agent.active_transfers(), 0);
        assert_eq!(group.total_deliveries(Tag::FileReq), 0);
    }

    #[test]
    fn request_destination_follows_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (group, agent, _rx) = setup(dir.path());
        let path = sample_file(dir.path(), 40);
        agent.send_file(&path, 2, DeliveryMode::P2p).unwrap();
        assert_eq!(group.deliveries(1, 2, Tag::FileReq), 1);
        agent.send_file(&path, 2, DeliveryMode::Relay).unwrap();
        assert_eq!(group.deliveries(1, 0, Tag::FileReq), 1);

        let reqs = drain(&group.endpoint(2));
        match &reqs[0].payload {
            Payload::FileReq(offer) => {
                assert_eq!(offer.from_rank, 1);
                assert_eq!(offer.to, "b");
                assert_eq!(offer.size, 40);
                assert_eq!(offer.filename, "notes.txt");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ack_starts_exactly_one_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (group, agent, _rx) = setup(dir.path());
        let path = sample_file(dir.path(), 40);
        let id = agent.send_file(&path, 2, DeliveryMode::Relay).unwrap();
        assert_eq!(agent.transfer_status(id), Some(TransferStatus::Requested));

        agent.handle_envelope(Envelope::new(Payload::FileAck(reply(id)), 0));
        assert_eq!(agent.active_transfers(), 0);
        agent.handle_envelope(Envelope::new(Payload::FileAck(reply(id)), 0));
        agent.wait_for_uploads();

        assert_eq!(agent.transfer_status(id), Some(TransferStatus::Done));
        assert_eq!(group.deliveries(1, 0, Tag::FileMeta), 1);
        assert_eq!(group.deliveries(1, 0, Tag::FileChunk), 3);
    }

    #[test]
    fn deny_means_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let (group, agent, mut rx) = setup(dir.path());
        let path = sample_file(dir.path(), 40);
        let id = agent.send_file(&path, 2, DeliveryMode::P2p).unwrap();
        agent.handle_envelope(Envelope::new(Payload::FileDeny(reply(id)), 0));
        agent.handle_envelope(Envelope::new(Payload::FileDeny(reply(id)), 0));
        agent.handle_envelope(Envelope::new(Payload::FileAck(reply(id)), 0));
        agent.wait_for_uploads();
        assert_eq!(agent.transfer_status(id), Some(TransferStatus::Denied));
        assert_eq!(group.total_deliveries(Tag::FileChunk), 0);
        assert_eq!(group.total_deliveries(Tag::FileMeta), 0);
        let denied = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, Event::TransferDenied { .. }))
            .count();
        assert_eq!(denied, 1);
    }

    #[test]
    fn ack_for_unknown_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (group, agent, _rx) = setup(dir.path());
        agent.handle_envelope(Envelope::new(Payload::FileAck(reply(Uuid::new_v4())), 0));
        agent.wait_for_uploads();
        assert_eq!(group.total_deliveries(Tag::FileMeta), 0);
    }

    #[test]
    fn offers_are_last_wins_and_accept_routes_ack_via_relay() {
        let dir = tempfile::tempdir().unwrap();
        let (group, agent, _rx) = setup(dir.path());
        let offer = |name: &str| TransferOffer {
            file_id: Uuid::new_v4(),
            filename: name.into(),
            size: 3,
            from: "b".into(),
            to: "a".into(),
            from_rank: 2,
        };
        let first = offer("one.txt");
        let second = offer("two.txt");
        agent.handle_envelope(Envelope::new(Payload::FileReq(first), 2));
        agent.handle_envelope(Envelope::new(Payload::FileReq(second.clone()), 2));
        assert_eq!(agent.pending_offers(), vec![second.clone()]);

        let accepted = agent.accept(2).unwrap();
        assert_eq!(accepted, second);
        assert_eq!(group.deliveries(1, 0, Tag::FileAck), 1);
        assert_eq!(group.deliveries(1, 2, Tag::FileAck), 0);
        match &drain(&group.endpoint(0))[0].payload {
            Payload::FileAck(r) => {
                assert_eq!(r.file_id, second.file_id);
                assert_eq!(r.to, "b");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(agent.accept(2), Err(CourierError::NoPendingOffer(2))));
        assert!(matches!(agent.deny(2), Err(CourierError::NoPendingOffer(2))));
    }

    #[test]
    fn deny_sends_deny_via_relay() {
        let dir = tempfile::tempdir().unwrap();
        let (group, agent, _rx) = setup(dir.path());
        agent.handle_envelope(Envelope::new(
            Payload::FileReq(TransferOffer {
                file_id: Uuid::new_v4(),
                filename: "x".into(),
                size: 1,
                from: "b".into(),
                to: "a".into(),
                from_rank: 2,
            }),
            0,
        ));
        agent.deny(2).unwrap();
        assert_eq!(group.deliveries(1, 0, Tag::FileDeny), 1);
        assert!(agent.pending_offers().is_empty());
    }

    fn meta_from(from: &str, filename: &str) -> FileMeta {
        FileMeta {
            file_id: Uuid::new_v4(),
            filename: filename.into(),
            size: 40,
            from: from.into(),
            to: "a".into(),
            chunk_size: 16,
            digest: [0u8; 32],
        }
    }

    fn failed_downloads(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<String> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                Event::DownloadFailed { filename, .. } => Some(filename),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn departed_sender_frees_its_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let (_group, agent, mut rx) = setup(dir.path());
        agent.handle_envelope(Envelope::new(Payload::FileMeta(meta_from("b", "x.bin")), 2));
        assert!(failed_downloads(&mut rx).is_empty());

        // A different sender may not take the name while b's transfer is open.
        agent.handle_envelope(Envelope::new(Payload::FileMeta(meta_from("c", "x.bin")), 0));
        assert_eq!(failed_downloads(&mut rx), vec!["x.bin".to_string()]);

        agent.on_presence_update(vec![peer(1, "a"), peer(3, "c")]);
        assert_eq!(failed_downloads(&mut rx), vec!["x.bin".to_string()]);
        assert_eq!(lock(&agent.inner.downloads).in_progress(), 0);

        agent.handle_envelope(Envelope::new(Payload::FileMeta(meta_from("c", "x.bin")), 0));
        assert!(failed_downloads(&mut rx).is_empty());
        assert_eq!(lock(&agent.inner.downloads).in_progress(), 1);
    }

    #[test]
    fn listener_expires_stalled_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let group = LocalGroup::new(3);
        let mut config = AgentConfig::new("a", "User_1", 0, dir.path().join("downloads"));
        config.download_idle_timeout = Duration::from_millis(30);
        let (agent, mut rx) = PeerAgent::new(Arc::new(group.endpoint(1)), config);
        agent.login().unwrap();
        group
            .endpoint(2)
            .send(Payload::FileMeta(meta_from("b", "slow.bin")), 1, Tag::FileMeta)
            .unwrap();
        let reason = loop {
            match rx.blocking_recv().unwrap() {
                Event::DownloadFailed { filename, reason } => {
                    assert_eq!(filename, "slow.bin");
                    break reason;
                }
                _ => continue,
            }
        };
        assert!(reason.contains("no data"), "{}", reason);
        assert!(!dir.path().join("downloads/slow.bin").exists());
        agent.logout(ShutdownPolicy::Wait).unwrap();
    }

    #[test]
    fn finished_upload_handles_are_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let (_group, agent, _rx) = setup(dir.path());
        let path = sample_file(dir.path(), 40);
        for _ in 0..5 {
            let id = agent.send_file(&path, 2, DeliveryMode::Relay).unwrap();
            agent.handle_envelope(Envelope::new(Payload::FileAck(reply(id)), 0));
            while agent.uploads_in_flight() > 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(lock(&agent.inner.uploads).len(), 1);
        agent.wait_for_uploads();
        assert!(lock(&agent.inner.uploads).is_empty());
    }

    #[test]
    fn listener_dispatches_until_logout() {
        let dir = tempfile::tempdir().unwrap();
        let (group, agent, mut rx) = setup(dir.path());
        agent.login().unwrap();
        assert_eq!(group.deliveries(1, 0, Tag::Cmd), 1);
        let router = group.endpoint(0);
        router
            .send(
                Payload::Chat(ChatMessage::system(Recipient::All, "welcome")),
                1,
                Tag::Msg,
            )
            .unwrap();
        let event = rx.blocking_recv().unwrap();
        assert!(matches!(event, Event::Chat(ref m) if m.content == "welcome"));
        agent.logout(ShutdownPolicy::Wait).unwrap();
        assert_eq!(group.deliveries(1, 0, Tag::Cmd), 2);
    }
}
