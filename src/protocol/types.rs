use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// One direction of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> {}:{}", self.src_ip, self.src_port, self.dst_ip, self.dst_port)
    }
}

/// An IPv4/TCP segment as delivered by the capture layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub flow: FlowKey,
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// What the capture collaborator hands to the meter.
#[derive(Debug, Clone)]
pub enum CapturedPacket {
    /// Full Ethernet II frame
    Ethernet(Vec<u8>),
    /// Raw IP packet (no link header)
    Ip(Vec<u8>),
    /// Already decoded segment
    Segment(Segment),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitRecord {
    pub attacker_packed: u64,
    pub skill_id: u64,
    pub damage: u64,
    pub lucky_value: Option<u64>,
    pub is_crit: bool,
    pub is_lucky: bool,
    pub is_miss: bool,
    pub hp_lessen: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DamageBuckets {
    pub normal: u64,
    pub critical: u64,
    pub lucky: u64,
    pub crit_lucky: u64,
    #[serde(rename = "hpLessen")]
    pub hp_lessen: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitCounts {
    pub normal: u64,
    pub critical: u64,
    pub lucky: u64,
    pub total: u64,
}

/// Read-only view of one player's statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerStatView {
    pub realtime_dps: u64,
    pub realtime_dps_max: u64,
    pub total_dps: f64,
    pub total_damage: DamageBuckets,
    pub total_count: HitCounts,
}

/// Per-player statistics in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub players: IndexMap<u64, PlayerStatView>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn get(&self, uid: u64) -> Option<&PlayerStatView> {
        self.players.get(&uid)
    }

    /// The `{ "code": 0, "user": { "<uid>": ... } }` payload the display polls.
    pub fn to_response(&self) -> serde_json::Value {
        serde_json::json!({
            "code": 0,
            "user": self.players,
        })
    }
}

/// Counters describing what the session has seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub segments_seen: u64,
    pub packets_dropped: u64,
    pub frames_decoded: u64,
    pub hits_recorded: u64,
    pub resets: u64,
}

/// Events pushed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum MeterEvent {
    FlowAcquired { flow: FlowKey },
    FlowLost { flow: FlowKey },
    PlayerResolved { uid: u64 },
    DataUpdate(Snapshot),
}
