//! `getaddr`/`addr` message construction and parsing.
//!
//! Gossip is passive: each side sends exactly one `getaddr` at handshake
//! time and answers the peer's `getaddr` with exactly one `addr`. There is
//! no periodic re-gossip — a node's membership view only grows at
//! connection-establishment time.

use crate::codec::Value;
use crate::endpoint::Endpoint;
use rand::seq::SliceRandom;

/// Reserved method name for the discovery request.
pub const GETADDR: &str = "getaddr";

/// Reserved method name for the discovery reply.
pub const ADDR: &str = "addr";

/// Builds the (ignored) payload for a `getaddr` message.
pub fn getaddr_payload() -> Value {
    Value::list(vec![])
}

/// Builds an `addr` reply payload.
///
/// `own_endpoint` is this node's own advertised endpoint, or `None` if it
/// has no listen address (encoded as the sentinel entry). `known` is the
/// full set of other endpoints this node currently has in its peer table;
/// up to `sample_size` of them are chosen at random so that repeated
/// exchanges surface different peers over time.
pub fn addr_payload(own_endpoint: Option<&Endpoint>, known: &[Endpoint], sample_size: usize) -> Value {
    let mut entries = Vec::with_capacity(1 + sample_size.min(known.len()));
    entries.push(encode_endpoint(
        own_endpoint.unwrap_or(&Endpoint::unlisted()),
    ));

    let mut indices: Vec<usize> = (0..known.len()).collect();
    indices.shuffle(&mut rand::thread_rng());
    for &i in indices.iter().take(sample_size) {
        entries.push(encode_endpoint(&known[i]));
    }

    Value::list(entries)
}

fn encode_endpoint(endpoint: &Endpoint) -> Value {
    Value::list(vec![
        Value::bytes(endpoint.host().as_bytes().to_vec()),
        Value::from_u16(endpoint.port()),
    ])
}

fn decode_endpoint(value: &Value) -> Option<Endpoint> {
    let items = value.as_list()?;
    if items.len() != 2 {
        return None;
    }
    let host = std::str::from_utf8(items[0].as_bytes()?).ok()?.to_string();
    let port = items[1].to_u16()?;
    Some(Endpoint::new(host, port))
}

/// The result of parsing an `addr` payload.
pub struct AddrReply {
    /// The sender's own advertised endpoint, `None` if it sent the
    /// unlisted sentinel.
    pub sender_endpoint: Option<Endpoint>,
    /// Other endpoints the sender gossiped.
    pub sample: Vec<Endpoint>,
}

/// Parses an `addr` payload received from a peer.
///
/// Malformed entries (wrong shape, non-UTF8 host, non-minimal port
/// encoding) are skipped rather than failing the whole parse — one bad
/// gossip entry should not discard the rest.
pub fn parse_addr_payload(payload: &Value) -> Option<AddrReply> {
    let items = payload.as_list()?;
    let mut iter = items.iter();
    let first = decode_endpoint(iter.next()?)?;
    let sender_endpoint = if first.is_unlisted() { None } else { Some(first) };
    let sample = iter.filter_map(decode_endpoint).collect();
    Some(AddrReply {
        sender_endpoint,
        sample,
    })
}
