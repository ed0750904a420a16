//! Codec conformance tests driven through the public API, covering cases
//! the in-module unit tests don't: recursion depth, wide lists, and a
//! short-list frame whose declared length leaves a sibling value
//! unconsumed rather than erroring.

use swarmlink_core::{codec, Value};

#[test]
fn deeply_nested_lists_round_trip() {
    let mut value = Value::bytes(vec![1, 2, 3]);
    for _ in 0..64 {
        value = Value::list(vec![value]);
    }
    let encoded = codec::encode(&value);
    let (decoded, consumed) = codec::decode(&encoded).unwrap();
    assert_eq!(consumed, encoded.len());
    assert_eq!(decoded, value);
}

#[test]
fn wide_list_round_trips() {
    let items: Vec<Value> = (0..300u16).map(Value::from_u16).collect();
    let value = Value::list(items.clone());
    let encoded = codec::encode(&value);
    let (decoded, consumed) = codec::decode(&encoded).unwrap();
    assert_eq!(consumed, encoded.len());
    assert_eq!(decoded.as_list().unwrap().len(), items.len());
}

#[test]
fn decode_stops_at_declared_list_length_leaving_siblings_unconsumed() {
    // List tag 0xc2 declares a 2-byte payload: two single-byte values. A
    // third byte follows that belongs to whatever comes after this list,
    // not to the list itself.
    let buf = vec![0xc2, 0x01, 0x02, 0x03];
    let (value, consumed) = codec::decode(&buf).unwrap();
    assert_eq!(consumed, 3);
    assert_eq!(
        value,
        Value::list(vec![Value::bytes(vec![0x01]), Value::bytes(vec![0x02])])
    );
}
