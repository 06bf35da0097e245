//! TCP transport between raft peers.
//!
//! Every frame is `len: u32 | from: u64 | addr_len: u16 | addr | message`,
//! where `addr` is the sender's advertised raft address. Receivers remember
//! the address of any peer they hear from, which lets a freshly joined node
//! answer the leader before it has applied the membership entries.

use super::EngineError;
use crate::net::bind_listener;
use bytes::{Buf, BufMut, BytesMut};
use crossbeam::channel::{bounded, Sender, TrySendError};
use dashmap::DashMap;
use hashbrown::HashMap;
use parking_lot::RwLock;
use protobuf::Message as _;
use raft::prelude::Message;
use slog::{debug, info, warn, Logger};
use std::io::{BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// Refuse frames larger than this
const MAX_FRAME: usize = 64 << 20;
/// Messages queued per peer before new ones are dropped
const OUTBOX_CAPACITY: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Raft message fan-out to peers plus the inbound listener
pub struct Transport {
    id: u64,
    advertise: String,
    peers: Arc<RwLock<HashMap<u64, String>>>,
    outboxes: DashMap<u64, Sender<Message>>,
    logger: Logger,
}

impl Transport {
    /// Bind the raft listener and start accepting peer connections
    ///
    /// Inbound messages are forwarded to `inbox`. Returns the transport and
    /// the address it actually bound.
    pub fn start(
        id: u64,
        bind: &str,
        advertise: Option<String>,
        inbox: Sender<Message>,
        logger: Logger,
    ) -> Result<(Arc<Self>, SocketAddr), EngineError> {
        let addr = bind
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no raft bind address"))?;
        let listener: TcpListener = bind_listener(addr, false)?;
        let local = listener.local_addr()?;

        let transport = Arc::new(Self {
            id,
            advertise: advertise.unwrap_or_else(|| local.to_string()),
            peers: Arc::new(RwLock::new(HashMap::new())),
            outboxes: DashMap::new(),
            logger,
        });

        let accept = transport.clone();
        std::thread::Builder::new()
            .name("raft-accept".into())
            .spawn(move || accept.accept_loop(listener, inbox))?;

        info!(transport.logger, "raft transport listening"; "addr" => %local, "advertise" => &transport.advertise);
        Ok((transport, local))
    }

    pub fn advertise(&self) -> &str {
        &self.advertise
    }

    /// Record (or update) where a peer can be reached
    pub fn add_peer(&self, id: u64, address: &str) {
        if id == self.id {
            return;
        }
        let mut peers = self.peers.write();
        if peers.get(&id).map(String::as_str) != Some(address) {
            peers.insert(id, address.to_string());
            // Writer re-resolves the address on its next connect
            drop(peers);
            self.outboxes.remove(&id);
        }
    }

    /// Forget a peer and shut down its writer
    pub fn remove_peer(&self, id: u64) {
        self.peers.write().remove(&id);
        self.outboxes.remove(&id);
    }

    /// Queue a message for its destination; dropped if the peer is backed up
    pub fn send(&self, msg: Message) {
        let to = msg.to;
        let outbox = self
            .outboxes
            .entry(to)
            .or_insert_with(|| self.spawn_writer(to))
            .clone();

        match outbox.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(self.logger, "peer outbox full, dropping message"; "to" => to);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.outboxes.remove(&to);
            }
        }
    }

    fn spawn_writer(&self, to: u64) -> Sender<Message> {
        let (tx, rx) = bounded::<Message>(OUTBOX_CAPACITY);
        let peers = self.peers.clone();
        let logger = self.logger.clone();
        let header = Header {
            id: self.id,
            advertise: self.advertise.clone(),
        };

        let spawned = std::thread::Builder::new()
            .name(format!("raft-peer-{:x}", to))
            .spawn(move || {
                let mut conn: Option<TcpStream> = None;
                for msg in rx.iter() {
                    let frame = match header.encode(&msg) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(logger, "failed to encode raft message"; "error" => %e);
                            continue;
                        }
                    };

                    if conn.is_none() {
                        conn = connect(&peers, to);
                    }
                    if let Some(stream) = conn.as_mut() {
                        if let Err(e) = stream.write_all(&frame) {
                            debug!(logger, "raft send failed"; "to" => to, "error" => %e);
                            conn = None;
                        }
                    }
                }
            });

        if let Err(e) = spawned {
            warn!(self.logger, "failed to spawn peer writer"; "to" => to, "error" => %e);
        }
        tx
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener, inbox: Sender<Message>) {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    let this = self.clone();
                    let inbox = inbox.clone();
                    let spawned = std::thread::Builder::new()
                        .name("raft-inbound".into())
                        .spawn(move || this.read_loop(stream, inbox));
                    if let Err(e) = spawned {
                        warn!(self.logger, "failed to spawn raft reader"; "error" => %e);
                    }
                }
                Err(e) => warn!(self.logger, "raft accept error"; "error" => %e),
            }
        }
    }

    fn read_loop(&self, stream: TcpStream, inbox: Sender<Message>) {
        let mut reader = BufReader::new(stream);
        let mut len_buf = [0u8; 4];
        loop {
            if reader.read_exact(&mut len_buf).is_err() {
                return;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_FRAME {
                warn!(self.logger, "oversized raft frame, closing connection"; "len" => len);
                return;
            }
            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                return;
            }

            match decode_frame(&payload) {
                Ok((from, addr, msg)) => {
                    if !self.peers.read().contains_key(&from) {
                        self.add_peer(from, &addr);
                    }
                    if inbox.send(msg).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(self.logger, "dropping malformed raft frame"; "error" => %e);
                }
            }
        }
    }
}

struct Header {
    id: u64,
    advertise: String,
}

impl Header {
    fn encode(&self, msg: &Message) -> Result<BytesMut, EngineError> {
        let body = msg.write_to_bytes()?;
        let len = 8 + 2 + self.advertise.len() + body.len();
        let mut buf = BytesMut::with_capacity(4 + len);
        buf.put_u32(len as u32);
        buf.put_u64(self.id);
        buf.put_u16(self.advertise.len() as u16);
        buf.put_slice(self.advertise.as_bytes());
        buf.put_slice(&body);
        Ok(buf)
    }
}

fn decode_frame(mut buf: &[u8]) -> Result<(u64, String, Message), EngineError> {
    let short = || std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short raft frame");
    if buf.remaining() < 10 {
        return Err(short().into());
    }
    let from = buf.get_u64();
    let addr_len = buf.get_u16() as usize;
    if buf.remaining() < addr_len {
        return Err(short().into());
    }
    let addr = String::from_utf8_lossy(&buf[..addr_len]).into_owned();
    buf.advance(addr_len);
    let msg = Message::parse_from_bytes(buf)?;
    Ok((from, addr, msg))
}

fn connect(peers: &RwLock<HashMap<u64, String>>, to: u64) -> Option<TcpStream> {
    let address = peers.read().get(&to).cloned()?;
    let addr = address.to_socket_addrs().ok()?.next()?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).ok()?;
    stream.set_nodelay(true).ok();
    Some(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_sender_and_message() {
        let header = Header {
            id: 7,
            advertise: "10.0.0.7:15379".into(),
        };
        let mut msg = Message::default();
        msg.to = 9;
        msg.from = 7;
        msg.term = 3;

        let frame = header.encode(&msg).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let (from, addr, decoded) = decode_frame(&frame[4..]).unwrap();
        assert_eq!(from, 7);
        assert_eq!(addr, "10.0.0.7:15379");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(decode_frame(&[0u8; 4]).is_err());
        let mut buf = BytesMut::new();
        buf.put_u64(1);
        buf.put_u16(50);
        buf.put_slice(b"short");
        assert!(decode_frame(&buf).is_err());
    }
}
