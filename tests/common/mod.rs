#![allow(dead_code)]

use crossbeam_channel::Receiver;
use etherparse::PacketBuilder;
use resonance_meter::protocol::tree::Value;
use resonance_meter::{FlowKey, MeterEvent, Segment};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

pub const SIGNATURE: [u8; 6] = [0x00, 0x63, 0x33, 0x53, 0x42, 0x00];
pub const KIND_IDENTITY: u8 = 0x2e;
pub const KIND_SYNC: u8 = 0x2d;

pub const SERVER: FlowKey = FlowKey {
    src_ip: Ipv4Addr::new(172, 65, 10, 20),
    src_port: 5003,
    dst_ip: Ipv4Addr::new(192, 168, 0, 10),
    dst_port: 51234,
};

pub const OTHER: FlowKey = FlowKey {
    src_ip: Ipv4Addr::new(104, 16, 0, 1),
    src_port: 443,
    dst_ip: Ipv4Addr::new(192, 168, 0, 10),
    dst_port: 51300,
};

/// Writes a message tree in wire format: integers as varints, lists as
/// repeated fields, everything else length-delimited.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    if let Value::Message(fields) = value {
        for (field, v) in fields {
            encode_field(&mut out, *field, v);
        }
    }
    out
}

fn encode_field(out: &mut Vec<u8>, field: u32, value: &Value) {
    let key = u64::from(field) << 3;
    match value {
        Value::Int(v) => {
            write_varint(out, key);
            write_varint(out, *v);
        }
        Value::Bytes(bytes) => write_len_delimited(out, key, bytes),
        Value::Message(_) => write_len_delimited(out, key, &encode(value)),
        Value::List(items) => {
            for item in items {
                encode_field(out, field, item);
            }
        }
    }
}

fn write_len_delimited(out: &mut Vec<u8>, key: u64, bytes: &[u8]) {
    write_varint(out, key | 2);
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn msg(fields: Vec<(u32, Value)>) -> Value {
    Value::Message(fields.into_iter().collect::<BTreeMap<_, _>>())
}

/// Packed identifier of a player entity
pub fn player(uid: u64) -> u64 {
    (uid << 16) | 640
}

/// Hit node from (field, integer) pairs
pub fn hit(fields: &[(u32, u64)]) -> Value {
    msg(fields.iter().map(|&(k, v)| (k, Value::Int(v))).collect())
}

fn sub_message(kind: u8, tree: &Value, signed: bool) -> Vec<u8> {
    let mut header = [0u8; 18];
    if signed {
        header[5..11].copy_from_slice(&SIGNATURE);
    }
    header[17] = kind;

    let body = encode(tree);
    let len = (4 + header.len() + body.len()) as u32;
    let mut out = len.to_be_bytes().to_vec();
    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    out
}

pub fn identity_sub(packed: u64) -> Vec<u8> {
    sub_message(KIND_IDENTITY, &msg(vec![(1, msg(vec![(5, Value::Int(packed))]))]), true)
}

/// Signed sub-message without identity, as the first handshake message
pub fn login_sub() -> Vec<u8> {
    sub_message(0x01, &msg(vec![(1, Value::Int(1))]), true)
}

/// One sync sub-message with one entity per hit list
pub fn sync_sub(entities: Vec<Vec<Value>>) -> Vec<u8> {
    let nodes = entities
        .into_iter()
        .map(|hits| msg(vec![(7, msg(vec![(2, Value::List(hits))]))]))
        .collect();
    sub_message(KIND_SYNC, &msg(vec![(1, Value::List(nodes))]), false)
}

/// Length-prefixed frame (length counts the prefix) with a zeroed sub-header
pub fn frame(subs: &[Vec<u8>]) -> Vec<u8> {
    let body = subs.concat();
    let len = (10 + body.len()) as u32;
    let mut out = len.to_be_bytes().to_vec();
    out.extend_from_slice(&[0u8; 6]);
    out.extend_from_slice(&body);
    out
}

pub fn segment(flow: FlowKey, seq: u32, payload: &[u8]) -> Segment {
    Segment {
        flow,
        seq,
        payload: payload.to_vec(),
    }
}

pub fn ethernet(flow: FlowKey, seq: u32, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2([0x02, 0, 0, 0, 0, 1], [0x02, 0, 0, 0, 0, 2])
        .ipv4(flow.src_ip.octets(), flow.dst_ip.octets(), 64)
        .tcp(flow.src_port, flow.dst_port, seq, 8192);
    let mut out = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut out, payload).unwrap();
    out
}

pub fn drain_events(rx: &Receiver<MeterEvent>) -> Vec<MeterEvent> {
    rx.try_iter().collect()
}

pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
