use crate::capture;
use crate::config::MeterConfig;
use crate::protocol::parser::{self, FrameEvent};
use crate::protocol::types::{CapturedPacket, FlowKey, MeterEvent, Segment, SessionStats, Snapshot};
use crate::services::reassembler::Reassembler;
use crate::services::stats::Aggregator;
use crossbeam_channel::{Sender, TrySendError};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct SessionState {
    active: Option<FlowKey>,
    reassembler: Reassembler,
    player_uid: Option<u64>,
}

#[derive(Debug, Default)]
struct Counters {
    segments_seen: AtomicU64,
    packets_dropped: AtomicU64,
    frames_decoded: AtomicU64,
    hits_recorded: AtomicU64,
    resets: AtomicU64,
}

/// One capture session: recognizes the game flow, reassembles it and feeds
/// decoded hits into the statistics.
///
/// Lock order is always `state` then `stats`.
#[derive(Debug)]
pub struct Sniffer {
    state: Mutex<SessionState>,
    stats: Aggregator,
    counters: Counters,
    events: Sender<MeterEvent>,
}

impl Sniffer {
    pub fn new(config: &MeterConfig, events: Sender<MeterEvent>) -> Self {
        Self {
            state: Mutex::new(SessionState {
                active: None,
                reassembler: Reassembler::new(config),
                player_uid: None,
            }),
            stats: Aggregator::new(config.window_ms),
            counters: Counters::default(),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: MeterEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => debug!("[Sniffer] Event channel full, dropping {:?}", event),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Entry point for anything the capture layer hands over.
    pub fn handle_packet(&self, packet: &CapturedPacket, now: u64) {
        let segment = match packet {
            CapturedPacket::Segment(segment) => {
                self.handle_segment(segment, now);
                return;
            }
            CapturedPacket::Ethernet(frame) => capture::segment_from_ethernet(frame),
            CapturedPacket::Ip(packet) => capture::segment_from_ip(packet),
        };

        match segment {
            Ok(segment) => self.handle_segment(&segment, now),
            Err(e) => {
                debug!("[Sniffer] Dropped packet: {}", e);
                self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn handle_segment(&self, segment: &Segment, now: u64) {
        // Ignore empty ACK packets
        if segment.payload.is_empty() {
            return;
        }
        self.counters.segments_seen.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state();

        // 1. Watchdog: the stream went quiet while traffic is still arriving
        if state.reassembler.is_stalled(now) {
            warn!("[Sniffer] Cannot capture the next packet! Is the game closed or disconnected?");
            self.reset_flow(&mut state);
        }
        state.reassembler.sweep(now);

        // 2. Not our flow: maybe a handshake
        if state.active != Some(segment.flow) {
            self.probe(&mut state, segment);
            return;
        }

        // 3. Reassemble and cut frames
        state.reassembler.push(segment.seq, &segment.payload, now);
        loop {
            match state.reassembler.next_frame() {
                Ok(Some(frame)) => {
                    self.counters.frames_decoded.fetch_add(1, Ordering::Relaxed);
                    self.interpret(&mut state, &frame, now);
                }
                Ok(None) => break,
                Err(e) => {
                    error!("[Sniffer] {} on {}, pending buffer discarded", e, segment.flow);
                    break;
                }
            }
        }
    }

    fn probe(&self, state: &mut SessionState, segment: &Segment) {
        let Some(handshake) = parser::probe_handshake(&segment.payload) else {
            return;
        };

        if let Some(old) = state.active.replace(segment.flow) {
            info!("[Sniffer] Switching away from {}", old);
        }
        state.reassembler.reset();
        info!("[Sniffer] Got Scene Server Address: {}", segment.flow);
        self.emit(MeterEvent::FlowAcquired { flow: segment.flow });

        // First writer wins while probing
        if state.player_uid.is_none() {
            if let Some(&uid) = handshake.identities.first() {
                state.player_uid = Some(uid);
                info!("[Sniffer] Got player UID! UID: {}", uid);
                self.emit(MeterEvent::PlayerResolved { uid });
            }
        }
    }

    fn interpret(&self, state: &mut SessionState, frame: &[u8], now: u64) {
        for event in parser::parse_frame(frame) {
            match event {
                FrameEvent::Identity { uid } => {
                    if state.player_uid != Some(uid) {
                        state.player_uid = Some(uid);
                        info!("[Sniffer] Got player UID! UID: {}", uid);
                        self.emit(MeterEvent::PlayerResolved { uid });
                    }
                }
                FrameEvent::Hit { player_id, hit } => {
                    self.stats.record_hit(player_id, hit.damage, hit.is_crit, hit.is_lucky, hit.hp_lessen, now);
                    self.counters.hits_recorded.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn reset_flow(&self, state: &mut SessionState) {
        state.reassembler.reset();
        if let Some(flow) = state.active.take() {
            self.emit(MeterEvent::FlowLost { flow });
        }
        self.counters.resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Periodic maintenance: cache deadlines and the DPS window.
    pub fn tick(&self, now: u64) {
        {
            let mut state = self.state();
            state.reassembler.sweep(now);
        }
        self.stats.sweep(now);
    }

    /// Pushes the current statistics to the presentation layer.
    pub fn publish(&self, now: u64) {
        let snapshot = self.snapshot(now);
        self.emit(MeterEvent::DataUpdate(snapshot));
    }

    /// Statistics as of `now`. Holding the session lock keeps the view
    /// consistent with whole frames and with `clear`.
    pub fn snapshot(&self, now: u64) -> Snapshot {
        let _state = self.state();
        self.stats.snapshot(now)
    }

    /// Forgets all statistics and any partially reassembled data.
    /// The active flow and the known player id survive.
    pub fn clear(&self) {
        let mut state = self.state();
        state.reassembler.reset();
        self.stats.clear();
        info!("[Sniffer] Statistics cleared");
    }

    pub fn player_uid(&self) -> Option<u64> {
        self.state().player_uid
    }

    pub fn active_flow(&self) -> Option<FlowKey> {
        self.state().active
    }

    pub fn session_stats(&self) -> SessionStats {
        SessionStats {
            segments_seen: self.counters.segments_seen.load(Ordering::Relaxed),
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
            frames_decoded: self.counters.frames_decoded.load(Ordering::Relaxed),
            hits_recorded: self.counters.hits_recorded.load(Ordering::Relaxed),
            resets: self.counters.resets.load(Ordering::Relaxed),
        }
    }
}
