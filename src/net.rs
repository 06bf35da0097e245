/*!
 * Network Layer
 *
 * Listener setup and the client accept loop. Every accepted connection
 * gets its own thread running a [`Session`]. Also hosts the tiny RESP
 * client a starting node uses to ask an existing member to add it.
 */

use crate::coordinator::Coordinator;
use crate::protocol::{parse_reply, write_request, Reply};
use crate::session::Session;
use anyhow::*;
use bytes::BytesMut;
use slog::{debug, info, o, warn, Logger};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Timeout for the startup join round trip
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Bind a blocking TCP listener
///
/// SO_REUSEADDR is always set so a restarted node can rebind right away;
/// SO_REUSEPORT only on request.
pub fn bind_listener(addr: SocketAddr, reuse_port: bool) -> std::io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(unix)]
    {
        socket.set_reuse_address(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
    }
    #[cfg(not(unix))]
    let _ = reuse_port;

    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    std::result::Result::Ok(socket.into())
}

/// Accept clients forever, one session thread per connection
///
/// Accept failures are logged and the loop keeps going.
pub fn serve(listener: TcpListener, coordinator: Arc<Coordinator>, logger: Logger) -> Result<()> {
    let local = listener.local_addr()?;
    info!(logger, "accepting clients"; "addr" => %local);

    let next_id = AtomicU64::new(1);
    for stream in listener.incoming() {
        let stream = match stream {
            std::result::Result::Ok(stream) => stream,
            Err(e) => {
                warn!(logger, "accept error"; "error" => %e);
                continue;
            }
        };
        stream.set_nodelay(true).ok();

        let conn = next_id.fetch_add(1, Ordering::Relaxed);
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let session_logger = logger.new(o!("conn" => conn, "peer" => peer));
        let coordinator = coordinator.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("session-{}", conn))
            .spawn(move || {
                debug!(session_logger, "session started");
                if let Err(e) = Session::new(stream, coordinator, session_logger.clone()).run() {
                    debug!(session_logger, "session ended"; "error" => %e);
                }
            });
        if let Err(e) = spawned {
            warn!(logger, "failed to spawn session"; "error" => %e);
        }
    }
    Ok(())
}

/// Ask the member at `peer` to add this node as a voter
///
/// Sends `join <raft_addr> <node_id>` over RESP and waits for one reply.
pub fn send_join(peer: &str, raft_addr: &str, node_id: &str) -> Result<()> {
    let addr = peer
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("cannot resolve {}", peer))?;
    let mut stream = TcpStream::connect_timeout(&addr, JOIN_TIMEOUT)?;
    stream.set_read_timeout(Some(JOIN_TIMEOUT))?;
    stream.set_write_timeout(Some(JOIN_TIMEOUT))?;

    let mut out = BytesMut::new();
    write_request(&[b"join", raft_addr.as_bytes(), node_id.as_bytes()], &mut out);
    stream.write_all(&out)?;

    let mut buf = BytesMut::with_capacity(256);
    let mut tmp = [0u8; 256];
    loop {
        if let Some((_, reply)) = parse_reply(&buf)? {
            return match reply {
                Reply::Status(_) => Ok(()),
                Reply::Error(msg) => bail!("join rejected by {}: {}", peer, msg),
                other => bail!("unexpected join reply from {}: {:?}", peer, other),
            };
        }
        let n = stream.read(&mut tmp)?;
        if n == 0 {
            bail!("{} closed the connection before replying", peer);
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}
