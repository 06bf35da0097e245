/*!
 * Redis RESP Protocol Implementation
 *
 * This module implements the subset of the Redis Serialization Protocol
 * (RESP) cinder speaks: requests are arrays of bulk strings, replies are
 * status strings, bulk strings (or nil), integers and errors. It also maps
 * command names onto the fixed set of commands the server understands.
 */

use anyhow::*;
use bytes::{BufMut, Bytes, BytesMut};

/// Most elements a single request may carry
pub const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// Largest bulk string a request may carry (512 MiB)
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Commands understood by a client session
///
/// The name table is built once; dispatch matches on the variant so every
/// command has to be handled explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandName {
    /// PING - connectivity check
    Ping,
    /// SET key value
    Set,
    /// GET key
    Get,
    /// DEL key
    Del,
    /// JOIN address nodeID - add a voter to the cluster
    Join,
    /// LEAVE nodeID - remove a member from the cluster
    Leave,
}

impl CommandName {
    const TABLE: [(&'static str, CommandName); 6] = [
        ("ping", CommandName::Ping),
        ("set", CommandName::Set),
        ("get", CommandName::Get),
        ("del", CommandName::Del),
        ("join", CommandName::Join),
        ("leave", CommandName::Leave),
    ];

    /// Look up a command by name, ignoring ASCII case
    pub fn parse(name: &[u8]) -> Option<Self> {
        Self::TABLE
            .iter()
            .find(|(n, _)| name.eq_ignore_ascii_case(n.as_bytes()))
            .map(|(_, c)| *c)
    }

    /// Number of arguments after the command name
    pub fn arity(self) -> usize {
        match self {
            CommandName::Ping => 0,
            CommandName::Get | CommandName::Del | CommandName::Leave => 1,
            CommandName::Set | CommandName::Join => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandName::Ping => "ping",
            CommandName::Set => "set",
            CommandName::Get => "get",
            CommandName::Del => "del",
            CommandName::Join => "join",
            CommandName::Leave => "leave",
        }
    }
}

/// A single reply sent back to a client
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// +<status>
    Status(String),
    /// $<len>\r\n<data> or $-1 for nil
    Bulk(Option<Bytes>),
    /// :<number>
    Integer(i64),
    /// -ERR <message>
    Error(String),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status("OK".into())
    }

    /// Append the RESP encoding of this reply to `out`
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Reply::Status(s) => write_simple(s, out),
            Reply::Bulk(Some(b)) => write_bulk(b, out),
            Reply::Bulk(None) => write_null(out),
            Reply::Integer(i) => write_integer(*i, out),
            Reply::Error(msg) => write_error(msg, out),
        }
    }
}

/// Parse a single RESP request from byte data
///
/// Requests are arrays of bulk strings:
/// `*<count>\r\n$<len>\r\n<data>\r\n...`. The first element is the command
/// name. An empty array parses to an empty request.
///
/// # Returns
/// * `Ok(Some((consumed_bytes, items)))` - Successfully parsed request
/// * `Ok(None)` - Incomplete data, need more bytes
/// * `Err(...)` - Protocol error
pub fn parse_request(data: &[u8]) -> Result<Option<(usize, Vec<Bytes>)>> {
    if data.is_empty() {
        return Ok(None);
    }

    // RESP requests must start with '*'
    if data[0] != b'*' {
        bail!("expected array");
    }

    let (i, n) = read_decimal_line(&data[1..])?;
    if i == 0 {
        return Ok(None);
    }
    let mut cursor = 1 + i;

    if n < 0 {
        bail!("null array is not a request");
    }
    if n > MAX_ARRAY_LEN {
        bail!("invalid multibulk length");
    }

    let mut items: Vec<Bytes> = Vec::with_capacity((n as usize).min(16));

    for _ in 0..n {
        if cursor >= data.len() {
            return Ok(None);
        }

        if data[cursor] != b'$' {
            bail!("expected bulk string");
        }

        let (i2, len) = read_decimal_line(&data[cursor + 1..])?;
        if i2 == 0 {
            return Ok(None);
        }
        if len < 0 {
            bail!("null bulk string in request");
        }
        if len > MAX_BULK_LEN {
            bail!("invalid bulk length");
        }
        cursor += 1 + i2;

        // Payload plus trailing \r\n
        let len = len as usize;
        let need = len + 2;
        if cursor + need > data.len() {
            return Ok(None);
        }
        if &data[cursor + len..cursor + need] != b"\r\n" {
            bail!("expected CRLF after bulk string");
        }

        items.push(Bytes::copy_from_slice(&data[cursor..cursor + len]));
        cursor += need;
    }

    Ok(Some((cursor, items)))
}

/// Parse a single RESP reply (used by the peer `join` client)
///
/// Same return convention as [`parse_request`].
pub fn parse_reply(data: &[u8]) -> Result<Option<(usize, Reply)>> {
    if data.is_empty() {
        return Ok(None);
    }

    let tag = data[0];
    let rest = &data[1..];
    match tag {
        b'+' | b'-' => {
            let Some(end) = find_crlf(rest) else {
                return Ok(None);
            };
            let text = String::from_utf8_lossy(&rest[..end]).into_owned();
            let reply = if tag == b'+' {
                Reply::Status(text)
            } else {
                Reply::Error(text.strip_prefix("ERR ").unwrap_or(&text).to_string())
            };
            Ok(Some((1 + end + 2, reply)))
        }
        b':' => {
            let (i, n) = read_decimal_line(rest)?;
            if i == 0 {
                return Ok(None);
            }
            Ok(Some((1 + i, Reply::Integer(n))))
        }
        b'$' => {
            let (i, len) = read_decimal_line(rest)?;
            if i == 0 {
                return Ok(None);
            }
            if len < 0 {
                return Ok(Some((1 + i, Reply::Bulk(None))));
            }
            let start = 1 + i;
            let len = len as usize;
            if start + len + 2 > data.len() {
                return Ok(None);
            }
            if &data[start + len..start + len + 2] != b"\r\n" {
                bail!("expected CRLF after bulk string");
            }
            let payload = Bytes::copy_from_slice(&data[start..start + len]);
            Ok(Some((start + len + 2, Reply::Bulk(Some(payload)))))
        }
        other => bail!("unexpected reply type byte {:?}", other as char),
    }
}

/// Number of bytes to drop to get past a malformed request
///
/// Skips whole lines until one starts with `*`, so the rest of a broken
/// frame is discarded together with it. Drops everything buffered when no
/// such line has arrived yet; stray lines of that frame arriving later are
/// reported again.
pub fn resync_len(data: &[u8]) -> usize {
    let mut pos = 0;
    while let Some(end) = find_crlf(&data[pos..]) {
        pos += end + 2;
        if data.get(pos) == Some(&b'*') {
            return pos;
        }
    }
    data.len()
}

fn find_crlf(s: &[u8]) -> Option<usize> {
    s.windows(2).position(|w| w == b"\r\n")
}

/// Read a decimal number followed by \r\n
///
/// Helper for RESP numeric fields like array lengths and bulk string
/// lengths.
///
/// # Returns
/// * `(bytes_consumed, parsed_number)`, or `(0, 0)` when incomplete
fn read_decimal_line(s: &[u8]) -> Result<(usize, i64)> {
    let mut i = 0;
    let mut num: i64 = 0;
    let mut sign: i64 = 1;

    if i < s.len() && s[i] == b'-' {
        sign = -1;
        i += 1;
    }

    let start = i;
    while i < s.len() {
        let c = s[i];
        if c.is_ascii_digit() {
            num = num
                .checked_mul(10)
                .and_then(|n| n.checked_add((c - b'0') as i64))
                .ok_or_else(|| anyhow!("length overflow"))?;
            i += 1;
        } else {
            break;
        }
    }

    if i + 1 < s.len() && s[i] == b'\r' && s[i + 1] == b'\n' {
        if i == start {
            bail!("expected digits");
        }
        Ok((i + 2, num * sign))
    } else if i + 1 >= s.len() && (i == s.len() || s[i] == b'\r') {
        // Incomplete
        Ok((0, 0))
    } else {
        bail!("expected CRLF");
    }
}

//
// RESP Encoders
//
// These append the various reply types to an output buffer.
//

/// Encode a simple string response (+OK\r\n)
pub fn write_simple(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.put_u8(b'+');
    out.put_slice(s.as_bytes());
    out.put_slice(b"\r\n");
}

/// Encode an error response (-ERR <msg>\r\n)
pub fn write_error(msg: &str, out: &mut BytesMut) {
    out.reserve(msg.len() + 7);
    out.put_slice(b"-ERR ");
    // Line breaks would end the reply early
    for b in msg.bytes() {
        out.put_u8(if b == b'\r' || b == b'\n' { b' ' } else { b });
    }
    out.put_slice(b"\r\n");
}

/// Encode a bulk string response ($<len>\r\n<data>\r\n)
pub fn write_bulk(b: &[u8], out: &mut BytesMut) {
    let len_str = b.len().to_string();
    out.reserve(1 + len_str.len() + 2 + b.len() + 2);
    out.put_u8(b'$');
    out.put_slice(len_str.as_bytes());
    out.put_slice(b"\r\n");
    out.put_slice(b);
    out.put_slice(b"\r\n");
}

/// Encode a null bulk response ($-1\r\n)
///
/// Used when a key doesn't exist
pub fn write_null(out: &mut BytesMut) {
    out.put_slice(b"$-1\r\n");
}

/// Encode an integer response (:<number>\r\n)
pub fn write_integer(i: i64, out: &mut BytesMut) {
    let i_str = i.to_string();
    out.reserve(1 + i_str.len() + 2);
    out.put_u8(b':');
    out.put_slice(i_str.as_bytes());
    out.put_slice(b"\r\n");
}

/// Encode an array header (*<count>\r\n)
pub fn write_array_len(n: usize, out: &mut BytesMut) {
    let n_str = n.to_string();
    out.put_u8(b'*');
    out.put_slice(n_str.as_bytes());
    out.put_slice(b"\r\n");
}

/// Encode a request as an array of bulk strings
pub fn write_request(parts: &[&[u8]], out: &mut BytesMut) {
    write_array_len(parts.len(), out);
    for p in parts {
        write_bulk(p, out);
    }
}
