/*!
 * Client Session Handler
 *
 * One session per accepted connection. The loop reads until a complete
 * request is buffered, dispatches it to the coordinator and flushes exactly
 * one reply before looking at the next request. Pipelined requests that
 * arrive in one read are served back to back.
 *
 * A malformed frame gets one protocol error reply; the session then skips
 * ahead to the next line starting with `*` and carries on.
 */

use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::protocol::{parse_request, resync_len, CommandName, Reply};
use bytes::{Buf, Bytes, BytesMut};
use slog::{debug, warn, Logger};
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Size of read buffer for incoming data
const READ_BUF: usize = 4096;

/// Per-connection state: the stream plus its read and write buffers
pub struct Session<S> {
    stream: S,
    coordinator: Arc<Coordinator>,
    rbuf: BytesMut,
    wbuf: BytesMut,
    logger: Logger,
}

impl<S: Read + Write> Session<S> {
    pub fn new(stream: S, coordinator: Arc<Coordinator>, logger: Logger) -> Self {
        Self {
            stream,
            coordinator,
            rbuf: BytesMut::with_capacity(READ_BUF),
            wbuf: BytesMut::with_capacity(READ_BUF),
            logger,
        }
    }

    /// Serve requests until the peer hangs up or a write fails
    ///
    /// End of stream is a clean exit. Read and write failures are returned.
    pub fn run(mut self) -> io::Result<()> {
        let mut tmp_buf = [0u8; READ_BUF];
        loop {
            // Drain every complete request already buffered
            while let Some(reply) = self.next_reply() {
                self.wbuf.clear();
                reply.encode(&mut self.wbuf);
                self.stream.write_all(&self.wbuf)?;
                self.stream.flush()?;
            }

            match self.stream.read(&mut tmp_buf) {
                Ok(0) => {
                    debug!(self.logger, "client closed connection");
                    return Ok(());
                }
                Ok(n) => self.rbuf.extend_from_slice(&tmp_buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Parse the next buffered request and produce its reply
    ///
    /// Returns `None` when more bytes are needed. A malformed request is
    /// skipped up to the next frame and answered with an error.
    fn next_reply(&mut self) -> Option<Reply> {
        match parse_request(&self.rbuf) {
            Ok(Some((consumed, items))) => {
                self.rbuf.advance(consumed);
                Some(self.dispatch(items))
            }
            Ok(None) => None,
            Err(e) => {
                warn!(self.logger, "protocol error"; "error" => %e);
                let skip = resync_len(&self.rbuf);
                self.rbuf.advance(skip);
                Some(Reply::Error(format!("protocol error: {}", e)))
            }
        }
    }

    fn dispatch(&self, items: Vec<Bytes>) -> Reply {
        match self.execute(items) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(self.logger, "command failed"; "error" => %e);
                Reply::Error(e.to_string())
            }
        }
    }

    fn execute(&self, items: Vec<Bytes>) -> Result<Reply, Error> {
        let mut items = items.into_iter();
        let cmd = items
            .next()
            .and_then(|name| CommandName::parse(&name))
            .ok_or(Error::UnsupportedCommand)?;

        let args = items
            .map(|arg| String::from_utf8(arg.to_vec()))
            .collect::<Result<Vec<String>, _>>()
            .map_err(|_| Error::Param(cmd.as_str()))?;
        if args.len() != cmd.arity() {
            return Err(Error::Param(cmd.as_str()));
        }

        let c = &self.coordinator;
        let reply = match cmd {
            CommandName::Ping => Reply::Status("PONG".into()),
            CommandName::Set => {
                c.write(&args[0], &args[1])?;
                Reply::ok()
            }
            CommandName::Get => Reply::Bulk(c.read(&args[0]).map(Bytes::from)),
            CommandName::Del => {
                c.delete(&args[0])?;
                Reply::ok()
            }
            CommandName::Join => {
                // join <address> <nodeID>
                c.join(&args[1], &args[0])?;
                Reply::ok()
            }
            CommandName::Leave => {
                c.leave(&args[0])?;
                Reply::ok()
            }
        };
        Ok(reply)
    }
}
