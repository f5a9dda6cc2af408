//! TCP transport: one connection per rank pair, hello + length-prefixed frames.
//!
//! Every rank listens on its member address and dials each lower rank, so each pair shares
//! exactly one connection. Inbound frames land in a `Mailbox`; outbound frames go through a
//! per-peer writer task fed by an unbounded channel.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use courier_core::protocol::{Control, Envelope, Payload, Rank, Tag, PROTOCOL_VERSION};
use courier_core::transport::{lock, Mailbox};
use courier_core::wire::{self, LEN_SIZE, MAX_FRAME_LEN};
use courier_core::{Transport, TransportError};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const HELLO_SIZE: usize = 1 + 4; // version + rank
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(0);

/// Writer side of one connection. The id tells a stale connection from its replacement.
struct Link {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

type Links = Arc<Mutex<HashMap<Rank, Link>>>;

pub struct TcpTransport {
    rank: Rank,
    mailbox: Arc<Mailbox>,
    links: Links,
}

impl TcpTransport {
    /// Bind this rank's member address, accept higher ranks, dial lower ranks.
    /// Must run inside a tokio runtime; the spawned tasks outlive this call.
    pub async fn start(
        rank: Rank,
        members: &BTreeMap<Rank, SocketAddr>,
    ) -> std::io::Result<Arc<Self>> {
        let bind = members.get(&rank).copied().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("rank {} has no member address", rank),
            )
        })?;
        let listener = TcpListener::bind(bind).await?;
        info!("rank {} listening on {}", rank, bind);
        let transport = Arc::new(Self {
            rank,
            mailbox: Arc::new(Mailbox::new()),
            links: Arc::new(Mutex::new(HashMap::new())),
        });

        let accept_mailbox = transport.mailbox.clone();
        let accept_links = transport.links.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, addr)) => {
                        let mailbox = accept_mailbox.clone();
                        let links = accept_links.clone();
                        tokio::spawn(async move {
                            match hello_accept(&mut stream, rank).await {
                                Ok(peer) => {
                                    info!("rank {} connected from {}", peer, addr);
                                    run_connection(stream, peer, mailbox, links).await;
                                }
                                Err(e) => warn!("rejected connection from {}: {}", addr, e),
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        for (&peer, &addr) in members.range(..rank) {
            let mailbox = transport.mailbox.clone();
            let links = transport.links.clone();
            tokio::spawn(async move {
                let mut stream = loop {
                    match TcpStream::connect(addr).await {
                        Ok(stream) => break stream,
                        Err(e) => {
                            debug!("rank {} at {} not up yet: {}", peer, addr, e);
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                };
                match hello_connect(&mut stream, rank, peer).await {
                    Ok(()) => {
                        info!("connected to rank {} at {}", peer, addr);
                        run_connection(stream, peer, mailbox, links).await;
                    }
                    Err(e) => warn!("handshake with rank {} failed: {}", peer, e),
                }
            });
        }
        Ok(transport)
    }

    /// Block until a link to `rank` exists or `timeout` passes.
    pub fn wait_for_link(&self, rank: Rank, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if rank == self.rank || lock(&self.links).contains_key(&rank) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn connected(&self) -> Vec<Rank> {
        let mut ranks: Vec<Rank> = lock(&self.links).keys().copied().collect();
        ranks.sort_unstable();
        ranks
    }

    /// Stop delivering: blocked receivers wake with `Closed`, and every link is dropped.
    pub fn close(&self) {
        self.mailbox.close();
        lock(&self.links).clear();
    }
}

impl Transport for TcpTransport {
    fn local_rank(&self) -> Rank {
        self.rank
    }

    fn send(&self, payload: Payload, dest: Rank, tag: Tag) -> Result<(), TransportError> {
        let envelope = Envelope {
            payload,
            source: self.rank,
            tag,
        };
        if dest == self.rank {
            if self.mailbox.is_closed() {
                return Err(TransportError::Closed);
            }
            self.mailbox.push(envelope);
            return Ok(());
        }
        let frame = wire::encode_frame(&envelope)?;
        let mut links = lock(&self.links);
        let link = links.get(&dest).ok_or(TransportError::Unreachable(dest))?;
        if link.tx.send(frame).is_err() {
            links.remove(&dest);
            return Err(TransportError::LinkFailed(dest));
        }
        Ok(())
    }

    fn receive(&self) -> Result<Envelope, TransportError> {
        self.mailbox.pop()
    }

    fn probe(&self) -> bool {
        !self.mailbox.is_empty()
    }

    fn wait(&self, timeout: Duration) -> bool {
        self.mailbox.wait(timeout)
    }
}

fn hello_bytes(rank: Rank) -> [u8; HELLO_SIZE] {
    let mut out = [0u8; HELLO_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..].copy_from_slice(&rank.to_le_bytes());
    out
}

fn parse_hello(buf: &[u8; HELLO_SIZE]) -> std::io::Result<Rank> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported protocol version {}", buf[0]),
        ));
    }
    let mut rank = [0u8; 4];
    rank.copy_from_slice(&buf[1..]);
    Ok(Rank::from_le_bytes(rank))
}

async fn hello_accept(stream: &mut TcpStream, local: Rank) -> std::io::Result<Rank> {
    let mut buf = [0u8; HELLO_SIZE];
    stream.read_exact(&mut buf).await?;
    let peer = parse_hello(&buf)?;
    if peer <= local {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("rank {} must not dial rank {}", peer, local),
        ));
    }
    stream.write_all(&hello_bytes(local)).await?;
    stream.flush().await?;
    Ok(peer)
}

async fn hello_connect(
    stream: &mut TcpStream,
    local: Rank,
    expected: Rank,
) -> std::io::Result<()> {
    stream.write_all(&hello_bytes(local)).await?;
    stream.flush().await?;
    let mut buf = [0u8; HELLO_SIZE];
    stream.read_exact(&mut buf).await?;
    let peer = parse_hello(&buf)?;
    if peer != expected {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("expected rank {}, got rank {}", expected, peer),
        ));
    }
    Ok(())
}

/// Pump frames both ways until the peer goes away, then report it as a LEAVE from that rank.
async fn run_connection(stream: TcpStream, peer: Rank, mailbox: Arc<Mailbox>, links: Links) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
    lock(&links).insert(peer, Link { id, tx });
    let (mut reader, mut writer) = stream.into_split();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
    });
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            warn!("rank {} sent an oversized frame ({} bytes)", peer, len);
            break;
        }
        let mut body = vec![0u8; len as usize];
        if reader.read_exact(&mut body).await.is_err() {
            break;
        }
        match wire::decode_body(&body) {
            Ok(mut envelope) => {
                envelope.source = peer;
                mailbox.push(envelope);
            }
            Err(e) => {
                warn!("bad frame from rank {}: {}", peer, e);
                break;
            }
        }
    }
    {
        let mut links = lock(&links);
        if links.get(&peer).is_some_and(|current| current.id == id) {
            links.remove(&peer);
        }
    }
    info!("rank {} disconnected", peer);
    if !mailbox.is_closed() {
        mailbox.push(Envelope {
            payload: Payload::Control(Control::Leave),
            source: peer,
            tag: Tag::Cmd,
        });
    }
}
