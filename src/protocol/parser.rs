use crate::protocol::tree::{self, Value};
use crate::protocol::types::HitRecord;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

// --- FRAME LAYOUT ---
// [u32 len][6 bytes]  sub-messages...
// sub-message: [u32 len][18 byte header][tag tree]
const FRAME_HEADER_LEN: usize = 10;
const MIN_FRAME_LEN: usize = 32;
const LEN_PREFIX: usize = 4;
const SUB_HEADER_LEN: usize = 18;
const KIND_OFFSET: usize = 17;
const KIND_IDENTITY: u8 = 0x2e;

// Handshake recognition
const HANDSHAKE_MARKER_OFFSET: usize = 4;
const SIGNATURE_OFFSET: usize = 5;
const SERVER_SIGNATURE: [u8; 6] = [0x00, 0x63, 0x33, 0x53, 0x42, 0x00];

// --- FIELD PATHS ---
const IDENTITY_PACKED: [u32; 2] = [1, 5];
const SYNC_ENTITIES: u32 = 1;
const ENTITY_HITS: [u32; 2] = [7, 2];
const HIT_MISS: u32 = 2;
const HIT_CRIT: u32 = 5;
const HIT_VALUE: u32 = 6;
const HIT_LUCKY_VALUE: u32 = 8;
const HIT_HP_LESSEN: u32 = 9;
const HIT_ATTACKER: u32 = 11;
const HIT_SKILL: u32 = 12;
const HIT_TOP_ATTACKER: u32 = 21;

// --- PACKED IDENTIFIERS ---
pub const UID_SHIFT: u32 = 16;
pub const CLASS_MASK: u64 = 0xFFFF;
pub const PLAYER_CLASS: u64 = 640;

pub fn uid_from_packed(packed: u64) -> u64 {
    packed >> UID_SHIFT
}

pub fn is_player(packed: u64) -> bool {
    packed & CLASS_MASK == PLAYER_CLASS
}

impl HitRecord {
    /// Player id of the attacker, `None` for non-player entities.
    pub fn player_id(&self) -> Option<u64> {
        if !is_player(self.attacker_packed) {
            return None;
        }
        match uid_from_packed(self.attacker_packed) {
            0 => None,
            uid => Some(uid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Identity { uid: u64 },
    Hit { player_id: u64, hit: HitRecord },
}

/// Result of probing a segment from an unrecognized flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    /// Player ids found in identity sub-messages, in wire order
    pub identities: Vec<u64>,
}

/// Iterates the length-prefixed sub-messages of a frame body.
/// Stops at the first length that is too small or overruns the data.
pub(crate) struct SubMessages<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SubMessages<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for SubMessages<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let rest = self.data.get(self.pos..)?;
        if rest.len() < LEN_PREFIX {
            return None;
        }
        let len = BigEndian::read_u32(rest) as usize;
        if len < LEN_PREFIX {
            debug!("[Parser] Sub-message length {} too small, dropping rest of frame", len);
            self.pos = self.data.len();
            return None;
        }
        let Some(body) = rest.get(LEN_PREFIX..len) else {
            debug!("[Parser] Sub-message length {} overruns {} remaining bytes", len, rest.len());
            self.pos = self.data.len();
            return None;
        };
        self.pos += len;
        Some(body)
    }
}

// --- STAGE 0: HANDSHAKE ---
// Recognizes the scene server flow from its login exchange.
pub fn probe_handshake(payload: &[u8]) -> Option<Handshake> {
    if payload.len() <= FRAME_HEADER_LEN || payload[HANDSHAKE_MARKER_OFFSET] != 0 {
        return None;
    }

    let mut handshake: Option<Handshake> = None;
    for body in SubMessages::new(&payload[FRAME_HEADER_LEN..]) {
        let signature = body.get(SIGNATURE_OFFSET..SIGNATURE_OFFSET + SERVER_SIGNATURE.len());
        if signature != Some(&SERVER_SIGNATURE[..]) {
            break;
        }

        // Only a decodable body counts as a handshake
        let Some(tree) = body.get(SUB_HEADER_LEN..).and_then(|data| tree::decode(data).ok()) else {
            debug!("[Parser] Signed sub-message with undecodable body");
            continue;
        };
        let found = handshake.get_or_insert_with(Handshake::default);

        if body[KIND_OFFSET] == KIND_IDENTITY {
            if let Some(uid) = identity_uid(&tree) {
                found.identities.push(uid);
            }
        }
    }
    handshake
}

// --- STAGE 1: FRAME ---
// Splits a frame into sub-messages and interprets each one on its own.
pub fn parse_frame(frame: &[u8]) -> Vec<FrameEvent> {
    let mut events = Vec::new();
    if frame.len() < MIN_FRAME_LEN {
        trace!("[Parser] Skipping short frame ({} bytes)", frame.len());
        return events;
    }

    for body in SubMessages::new(&frame[FRAME_HEADER_LEN..]) {
        if body.len() < SUB_HEADER_LEN {
            debug!("[Parser] Sub-message too short ({} bytes)", body.len());
            continue;
        }

        let tree = match tree::decode(&body[SUB_HEADER_LEN..]) {
            Ok(t) => t,
            Err(e) => {
                debug!("[Parser] Undecodable sub-message: {}", e);
                continue;
            }
        };

        if body[KIND_OFFSET] == KIND_IDENTITY {
            if let Some(uid) = identity_uid(&tree) {
                events.push(FrameEvent::Identity { uid });
            }
        } else {
            collect_hits(&tree, &mut events);
        }
    }
    events
}

fn identity_uid(tree: &Value) -> Option<u64> {
    let packed = tree.path(&IDENTITY_PACKED)?.as_u64()?;
    match uid_from_packed(packed) {
        0 => None,
        uid => Some(uid),
    }
}

// --- STAGE 2: HITS ---
fn collect_hits(tree: &Value, events: &mut Vec<FrameEvent>) {
    let Some(entities) = tree.field(SYNC_ENTITIES) else {
        return;
    };

    for entity in entities.items() {
        let Some(hits) = entity.path(&ENTITY_HITS) else {
            continue;
        };

        for node in hits.items() {
            // A hit without a numeric skill id means the rest of this entity is not combat data
            let Some(skill_id) = node.field(HIT_SKILL).and_then(Value::as_u64) else {
                trace!("[Parser] Hit without numeric skill id, skipping entity");
                break;
            };

            let Some(hit) = parse_hit(node, skill_id) else {
                trace!("[Parser] Hit without damage value");
                continue;
            };

            match hit.player_id() {
                Some(player_id) => events.push(FrameEvent::Hit { player_id, hit }),
                None => trace!("[Parser] Ignoring non-player attacker {:#x}", hit.attacker_packed),
            }
        }
    }
}

fn parse_hit(node: &Value, skill_id: u64) -> Option<HitRecord> {
    let lucky_value = node.field(HIT_LUCKY_VALUE).and_then(Value::as_u64);
    let damage = match node.field(HIT_VALUE) {
        Some(value) => value.as_u64()?,
        None => lucky_value?,
    };

    let attacker = node
        .field(HIT_TOP_ATTACKER)
        .filter(|v| v.is_truthy())
        .or_else(|| node.field(HIT_ATTACKER))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Some(HitRecord {
        attacker_packed: attacker,
        skill_id,
        damage,
        lucky_value,
        is_crit: node.field(HIT_CRIT).is_some_and(Value::is_truthy),
        is_lucky: lucky_value.is_some_and(|v| v != 0),
        is_miss: node.field(HIT_MISS).is_some_and(Value::is_truthy),
        hp_lessen: node.field(HIT_HP_LESSEN).and_then(Value::as_u64).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tree::encode;
    use std::collections::BTreeMap;

    fn msg(fields: Vec<(u32, Value)>) -> Value {
        Value::Message(fields.into_iter().collect::<BTreeMap<_, _>>())
    }

    fn sub_message(kind: u8, tree: &Value) -> Vec<u8> {
        let mut header = [0u8; SUB_HEADER_LEN];
        header[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 6].copy_from_slice(&SERVER_SIGNATURE);
        header[KIND_OFFSET] = kind;

        let body = encode(tree);
        let len = (LEN_PREFIX + SUB_HEADER_LEN + body.len()) as u32;
        let mut out = len.to_be_bytes().to_vec();
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);
        out
    }

    fn frame(subs: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = subs.concat();
        let len = (FRAME_HEADER_LEN + body.len()) as u32;
        let mut out = len.to_be_bytes().to_vec();
        out.extend_from_slice(&[0u8; FRAME_HEADER_LEN - 4]);
        out.extend_from_slice(&body);
        out
    }

    fn identity(packed: u64) -> Vec<u8> {
        sub_message(KIND_IDENTITY, &msg(vec![(1, msg(vec![(5, Value::Int(packed))]))]))
    }

    fn hit(fields: Vec<(u32, u64)>) -> Value {
        msg(fields.into_iter().map(|(k, v)| (k, Value::Int(v))).collect())
    }

    fn sync(entities: Vec<Vec<Value>>) -> Vec<u8> {
        let nodes: Vec<Value> = entities
            .into_iter()
            .map(|hits| msg(vec![(7, msg(vec![(2, Value::List(hits))]))]))
            .collect();
        sub_message(0x2d, &msg(vec![(1, Value::List(nodes))]))
    }

    fn player(uid: u64) -> u64 {
        (uid << UID_SHIFT) | PLAYER_CLASS
    }

    #[test]
    fn test_identity_resolves_uid() {
        let events = parse_frame(&frame(&[identity(777 << 16)]));
        assert_eq!(events, vec![FrameEvent::Identity { uid: 777 }]);
    }

    #[test]
    fn test_crit_hit() {
        let h = hit(vec![(12, 1001), (5, 1), (6, 100), (11, player(42))]);
        let events = parse_frame(&frame(&[sync(vec![vec![h]])]));

        let [FrameEvent::Hit { player_id, hit }] = events.as_slice() else {
            panic!("expected one hit, got {:?}", events);
        };
        assert_eq!(*player_id, 42);
        assert_eq!(hit.damage, 100);
        assert!(hit.is_crit);
        assert!(!hit.is_lucky);
        assert_eq!(hit.hp_lessen, 0);
    }

    #[test]
    fn test_lucky_value_is_damage_fallback() {
        let h = hit(vec![(12, 1), (5, 1), (8, 50), (9, 30), (21, player(7))]);
        let events = parse_frame(&frame(&[sync(vec![vec![h]])]));

        let [FrameEvent::Hit { player_id, hit }] = events.as_slice() else {
            panic!("expected one hit, got {:?}", events);
        };
        assert_eq!(*player_id, 7);
        assert_eq!(hit.damage, 50);
        assert!(hit.is_crit && hit.is_lucky);
        assert_eq!(hit.hp_lessen, 30);
    }

    #[test]
    fn test_top_attacker_wins_over_attacker() {
        let h = hit(vec![(12, 1), (6, 10), (21, player(5)), (11, player(6))]);
        let events = parse_frame(&frame(&[sync(vec![vec![h]])]));
        assert!(matches!(events.as_slice(), [FrameEvent::Hit { player_id: 5, .. }]));
    }

    #[test]
    fn test_non_player_and_zero_uid_are_dropped() {
        let monster = hit(vec![(12, 1), (6, 10), (11, (9 << 16) | 64)]);
        let nobody = hit(vec![(12, 1), (6, 10), (11, PLAYER_CLASS)]);
        let real = hit(vec![(12, 1), (6, 10), (11, player(3))]);
        let events = parse_frame(&frame(&[sync(vec![vec![monster, nobody, real]])]));
        assert!(matches!(events.as_slice(), [FrameEvent::Hit { player_id: 3, .. }]));
    }

    #[test]
    fn test_missing_skill_stops_only_that_entity() {
        let broken = hit(vec![(6, 10), (11, player(1))]);
        let after_broken = hit(vec![(12, 1), (6, 10), (11, player(1))]);
        let other_entity = hit(vec![(12, 1), (6, 20), (11, player(2))]);
        let events = parse_frame(&frame(&[sync(vec![vec![broken, after_broken], vec![other_entity]])]));
        assert!(matches!(events.as_slice(), [FrameEvent::Hit { player_id: 2, .. }]));
    }

    #[test]
    fn test_missing_damage_skips_only_that_hit() {
        let no_damage = hit(vec![(12, 1), (11, player(1))]);
        let ok = hit(vec![(12, 1), (6, 20), (11, player(1))]);
        let events = parse_frame(&frame(&[sync(vec![vec![no_damage, ok]])]));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_bad_sub_message_does_not_stop_siblings() {
        // Short sub-message: 4 byte prefix + 3 bytes
        let short = vec![0, 0, 0, 7, 1, 2, 3];
        let mut garbage = sub_message(0x2d, &msg(vec![]));
        garbage.extend_from_slice(&[0x0B, 0x0B]);
        let len = garbage.len() as u32;
        garbage[..4].copy_from_slice(&len.to_be_bytes());

        let events = parse_frame(&frame(&[short, garbage, identity(player(9))]));
        assert_eq!(events, vec![FrameEvent::Identity { uid: 9 }]);
    }

    #[test]
    fn test_short_frame_is_ignored() {
        assert!(parse_frame(&[0, 0, 0, 12, 0, 0, 0, 0, 0, 0, 0, 0]).is_empty());
    }

    #[test]
    fn test_handshake_probe() {
        let payload = frame(&[identity(player(11)), identity(player(12))]);
        let probe = probe_handshake(&payload).unwrap();
        assert_eq!(probe.identities, vec![11, 12]);
    }

    #[test]
    fn test_handshake_signature_mismatch_is_ignored() {
        let mut payload = frame(&[identity(player(11))]);
        payload[FRAME_HEADER_LEN + LEN_PREFIX + SIGNATURE_OFFSET + 1] ^= 0xFF;
        assert_eq!(probe_handshake(&payload), None);
    }

    fn undecodable_signed() -> Vec<u8> {
        let mut sub = sub_message(0x01, &msg(vec![]));
        // Wire type 3 is never valid
        sub.extend_from_slice(&[0x0B, 0x0B]);
        let len = sub.len() as u32;
        sub[..4].copy_from_slice(&len.to_be_bytes());
        sub
    }

    #[test]
    fn test_handshake_needs_decodable_body() {
        let payload = frame(&[undecodable_signed(), undecodable_signed()]);
        assert_eq!(probe_handshake(&payload), None);

        // A broken sub-message is skipped, later ones still count
        let payload = frame(&[undecodable_signed(), identity(player(11))]);
        assert_eq!(probe_handshake(&payload).map(|h| h.identities), Some(vec![11]));
    }

    #[test]
    fn test_handshake_marker_byte() {
        let mut marked = frame(&[identity(player(11))]);
        marked[HANDSHAKE_MARKER_OFFSET] = 1;
        assert_eq!(probe_handshake(&marked), None);
    }
}
