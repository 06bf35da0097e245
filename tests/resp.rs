use bytes::{Bytes, BytesMut};
use cinder::*;

#[test]
fn parse_ping_and_set_get() {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(
        b"*1\r\n$4\r\nPING\r\n",
    );
    buf.extend_from_slice(
        b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n",
    );
    buf.extend_from_slice(
        b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n",
    );

    let mut names = Vec::new();
    let mut rest: &[u8] = &buf;
    while let Some((used, items)) = parse_request(rest).unwrap() {
        names.push(CommandName::parse(&items[0]).unwrap());
        rest = &rest[used..];
    }
    assert!(rest.is_empty());
    assert_eq!(names, vec![CommandName::Ping, CommandName::Set, CommandName::Get]);
}

#[test]
fn partial_requests_wait_for_more_bytes() {
    let full = b"*3\r\n$3\r\nset\r\n$3\r\nkey\r\n$5\r\nvalue\r\n";
    for cut in 0..full.len() {
        assert!(parse_request(&full[..cut]).unwrap().is_none(), "cut at {}", cut);
    }
    let (used, items) = parse_request(full).unwrap().unwrap();
    assert_eq!(used, full.len());
    assert_eq!(items[2], Bytes::from_static(b"value"));
}

#[test]
fn binary_payloads_survive() {
    let mut out = BytesMut::new();
    write_request(&[b"set", b"k", b"a\r\nb\0c"], &mut out);
    let (_, items) = parse_request(&out).unwrap().unwrap();
    assert_eq!(&items[2][..], b"a\r\nb\0c");
}

#[test]
fn empty_array_is_an_empty_request() {
    let (used, items) = parse_request(b"*0\r\n").unwrap().unwrap();
    assert_eq!(used, 4);
    assert!(items.is_empty());
}

#[test]
fn malformed_requests_are_errors() {
    assert!(parse_request(b"PING\r\n").is_err());
    assert!(parse_request(b"*1\r\n:4\r\n").is_err());
    assert!(parse_request(b"*-1\r\n").is_err());
    assert!(parse_request(b"*1\r\n$-1\r\n").is_err());
    assert!(parse_request(b"*1\r\n$4\r\nPINGxx").is_err());
    assert!(parse_request(b"*x\r\n").is_err());
}

#[test]
fn resync_skips_the_bad_line() {
    let buf = b"GARBAGE\r\n*1\r\n$4\r\nPING\r\n";
    let skip = resync_len(buf);
    assert_eq!(skip, 9);
    let (_, items) = parse_request(&buf[skip..]).unwrap().unwrap();
    assert_eq!(CommandName::parse(&items[0]), Some(CommandName::Ping));
}

#[test]
fn resync_drops_the_rest_of_a_broken_frame() {
    let buf = b"*1\r\n+foo\r\n*1\r\n$4\r\nPING\r\n";
    assert!(parse_request(buf).is_err());
    let skip = resync_len(buf);
    assert_eq!(skip, 10);
    let (used, items) = parse_request(&buf[skip..]).unwrap().unwrap();
    assert_eq!(used, buf.len() - skip);
    assert_eq!(CommandName::parse(&items[0]), Some(CommandName::Ping));

    // Nothing to resync to yet
    assert_eq!(resync_len(b"*1\r\n+foo\r\n"), 10);
    assert_eq!(resync_len(b"junk"), 4);
}

#[test]
fn oversized_counts_are_rejected_up_front() {
    assert!(parse_request(b"*4611686018427387904\r\n").is_err());
    assert!(parse_request(b"*10000000000\r\n").is_err());
    assert!(parse_request(b"*1048577\r\n").is_err());
    // At the limit the parser just waits for the elements
    assert!(parse_request(b"*1048576\r\n").unwrap().is_none());

    assert!(parse_request(b"*2\r\n$3\r\nset\r\n$9999999999\r\n").is_err());
    assert!(parse_request(b"*1\r\n$536870913\r\n").is_err());
    assert!(parse_request(b"*1\r\n$536870912\r\n").unwrap().is_none());
}

#[test]
fn command_names_ignore_case() {
    assert_eq!(CommandName::parse(b"JoIn"), Some(CommandName::Join));
    assert_eq!(CommandName::parse(b"LEAVE"), Some(CommandName::Leave));
    assert_eq!(CommandName::parse(b"incr"), None);
    assert_eq!(CommandName::Set.arity(), 2);
    assert_eq!(CommandName::Ping.arity(), 0);
}

#[test]
fn reply_encoding() {
    let cases = [
        (Reply::ok(), "+OK\r\n"),
        (Reply::Status("PONG".into()), "+PONG\r\n"),
        (Reply::Bulk(Some(Bytes::from_static(b"1"))), "$1\r\n1\r\n"),
        (Reply::Bulk(Some(Bytes::new())), "$0\r\n\r\n"),
        (Reply::Bulk(None), "$-1\r\n"),
        (Reply::Integer(-3), ":-3\r\n"),
        (Reply::Error("not leader".into()), "-ERR not leader\r\n"),
        (Reply::Error("two\r\nlines".into()), "-ERR two  lines\r\n"),
    ];
    for (reply, wire) in cases {
        let mut out = BytesMut::new();
        reply.encode(&mut out);
        assert_eq!(String::from_utf8_lossy(&out), wire);
    }
}

#[test]
fn parse_replies() {
    assert_eq!(parse_reply(b"+OK\r\n").unwrap(), Some((5, Reply::ok())));
    assert_eq!(
        parse_reply(b"-ERR node n2 already joined raft cluster\r\n").unwrap().unwrap().1,
        Reply::Error("node n2 already joined raft cluster".into())
    );
    assert_eq!(parse_reply(b":12\r\n").unwrap(), Some((5, Reply::Integer(12))));
    assert_eq!(parse_reply(b"$-1\r\n").unwrap(), Some((5, Reply::Bulk(None))));
    assert_eq!(
        parse_reply(b"$2\r\nhi\r\n").unwrap(),
        Some((8, Reply::Bulk(Some(Bytes::from_static(b"hi")))))
    );
    assert_eq!(parse_reply(b"$2\r\nh").unwrap(), None);
    assert_eq!(parse_reply(b"+OK").unwrap(), None);
    assert!(parse_reply(b"?\r\n").is_err());
}
