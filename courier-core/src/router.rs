//! Directory/relay: the live peer table and the tag-agnostic forwarding rule.
//!
//! Host-driven like the rest of the core: `on_envelope` turns one received record into
//! actions, and `serve` is the loop that drives it over a `Transport`.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::CourierError;
use crate::protocol::{ChatMessage, Control, Envelope, Payload, Peer, Rank, Recipient, Tag};
use crate::transport::{Transport, TransportError};

/// What the host should do after the router processed a record.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterAction {
    Send {
        dest: Rank,
        tag: Tag,
        payload: Payload,
    },
    Shutdown,
}

impl RouterAction {
    fn send(dest: Rank, payload: Payload) -> Self {
        RouterAction::Send {
            dest,
            tag: payload.tag(),
            payload,
        }
    }
}

pub struct Router {
    rank: Rank,
    peers: BTreeMap<Rank, Peer>,
}

impl Router {
    /// `rank` is the router's own, well-known rank.
    pub fn new(rank: Rank) -> Self {
        Self {
            rank,
            peers: BTreeMap::new(),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Presence snapshot, ordered by rank.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn is_registered(&self, rank: Rank) -> bool {
        self.peers.contains_key(&rank)
    }

    /// Reverse lookup: identity → rank.
    pub fn resolve(&self, identity: &str) -> Result<Rank, CourierError> {
        self.peers
            .values()
            .find(|p| p.identity == identity)
            .map(|p| p.rank)
            .ok_or_else(|| CourierError::Routing(format!("{} is not online", identity)))
    }

    pub fn on_envelope(&mut self, envelope: Envelope) -> Vec<RouterAction> {
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
            return Vec::new();
        }
        match payload {
            Payload::Control(cmd) => self.handle_control(cmd, source),
            other => self.route(other, source, tag),
        }
    }

    pub fn handle_control(&mut self, cmd: Control, source: Rank) -> Vec<RouterAction> {
        match cmd {
            Control::Join {
                identity,
                display_name,
            } => self.on_join(identity, display_name, source),
            Control::Leave => self.on_leave(source),
            Control::Shutdown => {
                info!("shutdown requested by rank {}", source);
                vec![RouterAction::Shutdown]
            }
            Control::UserListUpdate { .. } => {
                debug!("ignoring presence snapshot sent to the router by rank {}", source);
                Vec::new()
            }
        }
    }

    fn on_join(&mut self, identity: String, display_name: String, source: Rank) -> Vec<RouterAction> {
        if source == self.rank {
            warn!("ignoring join from the router's own rank");
            return Vec::new();
        }
        if let Some(holder) = self
            .peers
            .values()
            .find(|p| p.identity == identity && p.rank != source)
        {
            warn!(
                "rank {} tried to join as {}, already online at rank {}",
                source, identity, holder.rank
            );
            let notice = ChatMessage::system(
                Recipient::peer(&identity),
                format!("Identity {} is already online at rank {}.", identity, holder.rank),
            );
            return vec![RouterAction::send(source, Payload::Chat(notice))];
        }
        info!("{} joined as {} (rank {})", display_name, identity, source);
        let notice = format!("{} has joined the chat.", display_name);
        self.peers.insert(
            source,
            Peer {
                identity,
                display_name,
                rank: source,
            },
        );
        self.membership_changed(notice)
    }

    fn on_leave(&mut self, source: Rank) -> Vec<RouterAction> {
        match self.peers.remove(&source) {
            Some(peer) => {
                info!("{} left (rank {})", peer.display_name, source);
                self.membership_changed(format!("{} has left the chat.", peer.display_name))
            }
            None => {
                debug!("leave from unregistered rank {}", source);
                Vec::new()
            }
        }
    }

    /// A send to `rank` failed: treat it as a disconnect.
    pub fn on_disconnect(&mut self, rank: Rank) -> Vec<RouterAction> {
        if self.peers.contains_key(&rank) {
            warn!("lost rank {}; removing it from the directory", rank);
        }
        self.on_leave(rank)
    }

    /// SYSTEM notice plus the full snapshot, to every connected peer.
    fn membership_changed(&self, notice: String) -> Vec<RouterAction> {
        let notice = ChatMessage::system(Recipient::All, notice);
        let snapshot = Control::UserListUpdate {
            peers: self.peers(),
        };
        let mut actions = Vec::with_capacity(self.peers.len() * 2);
        for &rank in self.peers.keys() {
            actions.push(RouterAction::send(rank, Payload::Chat(notice.clone())));
            actions.push(RouterAction::send(rank, Payload::Control(snapshot.clone())));
        }
        actions
    }

    pub fn route(&self, payload: Payload, source: Rank, tag: Tag) -> Vec<RouterAction> {
        if !self.peers.contains_key(&source) {
            warn!("dropping {:?} from unregistered rank {}", tag, source);
            return Vec::new();
        }
        let Some(recipient) = payload.recipient() else {
            warn!("dropping {:?} from rank {}: no recipient", tag, source);
            return Vec::new();
        };
        match recipient {
            Recipient::All => self
                .peers
                .keys()
                .filter(|&&rank| rank != source && rank != self.rank)
                .map(|&rank| RouterAction::Send {
                    dest: rank,
                    tag,
                    payload: payload.clone(),
                })
                .collect(),
            Recipient::Peer(identity) => match self.resolve(&identity) {
                Ok(dest) => {
                    debug!("routing {:?} from rank {} to rank {}", tag, source, dest);
                    vec![RouterAction::Send { dest, tag, payload }]
                }
                Err(e) => {
                    warn!("dropping {:?} from rank {}: {}", tag, source, e);
                    if tag == Tag::FileChunk {
                        return Vec::new();
                    }
                    let sender = self.peers[&source].identity.clone();
                    let notice = ChatMessage::system(
                        Recipient::Peer(sender),
                        format!("{} is not online; your {} was not delivered.", identity, describe(tag)),
                    );
                    vec![RouterAction::send(source, Payload::Chat(notice))]
                }
            },
        }
    }

    /// Drive the router over `transport` until SHUTDOWN or the transport closes.
    /// `poll` bounds each wait so the loop never blocks indefinitely between records.
    pub fn serve(&mut self, transport: &dyn Transport, poll: Duration) -> Result<(), TransportError> {
        info!("router started on rank {}", self.rank);
        while self.serve_once(transport, poll)? {}
        Ok(())
    }

    /// Wait up to `poll` for one record and carry out everything it causes.
    /// Returns `Ok(false)` once the router should stop.
    pub fn serve_once(&mut self, transport: &dyn Transport, poll: Duration) -> Result<bool, TransportError> {
        if !transport.wait(poll) {
            return Ok(true);
        }
        let envelope = match transport.receive() {
            Ok(env) => env,
            Err(TransportError::Closed) => {
                info!("transport closed; router stopping");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let mut queue: VecDeque<RouterAction> = self.on_envelope(envelope).into();
        while let Some(action) = queue.pop_front() {
            match action {
                RouterAction::Send { dest, tag, payload } => {
                    if let Err(e) = transport.send(payload, dest, tag) {
                        warn!("send {:?} to rank {} failed: {}", tag, dest, e);
                        queue.extend(self.on_disconnect(dest));
                    }
                }
                RouterAction::Shutdown => {
                    info!("router on rank {} stopped", self.rank);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

fn describe(tag: Tag) -> &'static str {
    match tag {
        Tag::Msg => "message",
        Tag::FileReq => "file offer",
        Tag::FileAck => "acceptance",
        Tag::FileDeny => "refusal",
        Tag::FileMeta => "file",
        Tag::FileChunk => "file chunk",
        Tag::Cmd => "command",
    }
}
