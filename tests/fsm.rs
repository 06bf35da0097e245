use cinder::*;
use slog::{o, Discard, Logger};
use std::collections::BTreeMap;

fn fsm() -> StateMachine {
    StateMachine::new(Logger::root(Discard, o!()))
}

fn entry(cmd: KeyValueCommand) -> Vec<u8> {
    cmd.encode().unwrap()
}

#[test]
fn set_then_get() {
    let sm = fsm();
    sm.apply(&entry(KeyValueCommand::set("a", "1"))).unwrap();
    assert_eq!(sm.get("a").as_deref(), Some("1"));
    assert_eq!(sm.get("b"), None);
}

#[test]
fn absent_and_empty_are_distinct() {
    let sm = fsm();
    sm.apply(&entry(KeyValueCommand::set("empty", ""))).unwrap();
    assert_eq!(sm.get("empty").as_deref(), Some(""));
    assert_eq!(sm.get("missing"), None);
}

#[test]
fn delete_is_idempotent() {
    let sm = fsm();
    sm.apply(&entry(KeyValueCommand::set("a", "1"))).unwrap();
    sm.apply(&entry(KeyValueCommand::del("a"))).unwrap();
    assert_eq!(sm.get("a"), None);
    sm.apply(&entry(KeyValueCommand::del("a"))).unwrap();
    assert!(sm.is_empty());
}

#[test]
fn operation_tags_are_case_insensitive() {
    let sm = fsm();
    sm.apply(br#"{"op":"set","key":"k","value":"v"}"#).unwrap();
    assert_eq!(sm.get("k").as_deref(), Some("v"));
    sm.apply(br#"{"op":"Del","key":"k"}"#).unwrap();
    assert_eq!(sm.get("k"), None);
}

#[test]
fn unknown_operation_is_rejected_without_side_effects() {
    let sm = fsm();
    sm.apply(&entry(KeyValueCommand::set("a", "1"))).unwrap();
    let err = sm.apply(br#"{"op":"INCR","key":"a"}"#).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation(ref op) if op == "INCR"));

    // Missing op decodes to an empty tag, which is also unsupported
    let err = sm.apply(br#"{"key":"a"}"#).unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation(ref op) if op.is_empty()));

    assert_eq!(sm.get("a").as_deref(), Some("1"));
    assert_eq!(sm.len(), 1);
}

#[test]
fn corrupt_entry_is_a_no_op() {
    let sm = fsm();
    sm.apply(&entry(KeyValueCommand::set("a", "1"))).unwrap();
    assert!(matches!(sm.apply(b"\x00\xffnot json"), Err(Error::Codec(_))));
    assert_eq!(sm.get("a").as_deref(), Some("1"));
}

#[test]
fn last_writer_wins_in_commit_order() {
    let sm = fsm();
    let log = [
        KeyValueCommand::set("x", "1"),
        KeyValueCommand::set("y", "2"),
        KeyValueCommand::set("x", "3"),
        KeyValueCommand::del("y"),
        KeyValueCommand::set("z", "4"),
        KeyValueCommand::set("y", "5"),
    ];

    let mut expected = BTreeMap::new();
    for cmd in &log {
        sm.apply(&entry(cmd.clone())).unwrap();
        match cmd.op {
            Operation::Set => {
                expected.insert(cmd.key.clone(), cmd.value.clone().unwrap_or_default());
            }
            _ => {
                expected.remove(&cmd.key);
            }
        }
    }

    let actual: BTreeMap<String, String> = sm.snapshot().collect();
    assert_eq!(actual, expected);
}

#[test]
fn snapshot_is_a_point_in_time_copy() {
    let sm = fsm();
    sm.apply(&entry(KeyValueCommand::set("a", "1"))).unwrap();
    let snap = sm.snapshot();
    sm.apply(&entry(KeyValueCommand::set("b", "2"))).unwrap();
    let pairs: Vec<_> = snap.collect();
    assert_eq!(pairs, vec![("a".to_string(), "1".to_string())]);
}

#[test]
fn restore_replaces_everything() {
    let sm = fsm();
    sm.apply(&entry(KeyValueCommand::set("old", "x"))).unwrap();
    sm.restore(vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]);
    assert_eq!(sm.get("old"), None);
    assert_eq!(sm.get("b").as_deref(), Some("2"));
    assert_eq!(sm.len(), 2);
}
