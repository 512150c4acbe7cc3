//! Passive combat meter for Blue Protocol: Star Resonance.
//!
//! Captured packets go in, per-player damage statistics come out:
//! flow recognition, TCP reassembly, framing, tag-tree decoding and
//! sliding-window aggregation.

pub mod capture;
pub mod config;
pub mod error;
pub mod packet_buffer;
pub mod protocol;
pub mod services;

pub use config::MeterConfig;
pub use error::{MeterError, Result};
pub use protocol::types::{
    CapturedPacket, DamageBuckets, FlowKey, HitCounts, MeterEvent, PlayerStatView, Segment, SessionStats, Snapshot,
};
pub use services::sniffer::Sniffer;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Installs the env_logger backend. `RUST_LOG` wins over `config.log_level`.
/// Calling it twice is harmless.
pub fn init_logging(config: &MeterConfig) {
    let env = env_logger::Env::default().default_filter_or(config.log_level.as_str());
    let _ = env_logger::Builder::from_env(env).format_timestamp_millis().try_init();
}

/// A running capture session with its worker threads.
pub struct Meter {
    config: MeterConfig,
    sniffer: Arc<Sniffer>,
    events: Receiver<MeterEvent>,
    running: Arc<AtomicBool>,
    // Bumped on every start so workers of an older run retire
    generation: Arc<AtomicU64>,
    workers: Vec<JoinHandle<()>>,
}

impl Meter {
    pub fn new(config: MeterConfig) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(config.event_capacity.max(1));
        let sniffer = Arc::new(Sniffer::new(&config, tx));
        Self {
            config,
            sniffer,
            events: rx,
            running: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            workers: Vec::new(),
        }
    }

    /// Starts consuming `packets`. The packet worker exits when the channel
    /// disconnects or the meter stops.
    pub fn start(&mut self, packets: Receiver<CapturedPacket>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MeterError::AlreadyRunning);
        }
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // --- PACKET THREAD ---
        let sniffer = Arc::clone(&self.sniffer);
        let running = Arc::clone(&self.running);
        let generation = Arc::clone(&self.generation);
        let poll = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        let packet_worker = thread::Builder::new()
            .name("meter-packets".to_string())
            .spawn(move || {
                info!("[Meter] Packet worker active (Gen {})", my_generation);
                while running.load(Ordering::Relaxed) && generation.load(Ordering::Relaxed) == my_generation {
                    match packets.recv_timeout(poll) {
                        Ok(packet) => sniffer.handle_packet(&packet, now_ms()),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => {
                            info!("[Meter] Capture channel closed");
                            break;
                        }
                    }
                }
                debug!("[Meter] Packet worker (Gen {}) terminated", my_generation);
            });
        let packet_worker = match packet_worker {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(MeterError::Spawn(e));
            }
        };
        self.workers.push(packet_worker);

        // --- MAINTENANCE THREAD ---
        let sniffer = Arc::clone(&self.sniffer);
        let running = Arc::clone(&self.running);
        let generation = Arc::clone(&self.generation);
        let sweep_every = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        let push_every_ms = self.config.push_interval_ms;
        let maintenance = thread::Builder::new()
            .name("meter-maintenance".to_string())
            .spawn(move || {
                let mut last_push = 0u64;
                loop {
                    thread::sleep(sweep_every);
                    if !running.load(Ordering::Relaxed) || generation.load(Ordering::Relaxed) != my_generation {
                        break;
                    }

                    let now = now_ms();
                    sniffer.tick(now);
                    if now.saturating_sub(last_push) >= push_every_ms {
                        sniffer.publish(now);
                        last_push = now;
                    }
                }
                debug!("[Meter] Maintenance worker (Gen {}) terminated", my_generation);
            });
        match maintenance {
            Ok(handle) => self.workers.push(handle),
            Err(e) => {
                let _ = self.stop();
                return Err(MeterError::Spawn(e));
            }
        }

        Ok(())
    }

    /// Signals the workers and waits for them.
    pub fn stop(&mut self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(MeterError::NotRunning);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        info!("[Meter] Stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.sniffer.snapshot(now_ms())
    }

    pub fn clear(&self) {
        self.sniffer.clear();
    }

    pub fn session_stats(&self) -> SessionStats {
        self.sniffer.session_stats()
    }

    /// Event stream for the presentation layer.
    pub fn events(&self) -> &Receiver<MeterEvent> {
        &self.events
    }

    pub fn sniffer(&self) -> &Arc<Sniffer> {
        &self.sniffer
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }
}

impl Drop for Meter {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
