use crate::protocol::types::{DamageBuckets, HitCounts, PlayerStatView, Snapshot};
use indexmap::IndexMap;
use log::trace;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct PlayerStat {
    damage: DamageBuckets,
    count: HitCounts,
    // (timestamp ms, damage), oldest first
    window: VecDeque<(u64, u64)>,
    window_max: u64,
    first_hit: Option<u64>,
    last_hit: Option<u64>,
}

impl PlayerStat {
    // Damage comes straight from wire varints, so every counter saturates
    fn record(&mut self, damage: u64, crit: bool, lucky: bool, hp_lessen: u64, now: u64) {
        let damage_bucket = match (crit, lucky) {
            (true, true) => {
                bump(&mut self.count.critical, 1);
                bump(&mut self.count.lucky, 1);
                &mut self.damage.crit_lucky
            }
            (true, false) => {
                bump(&mut self.count.critical, 1);
                &mut self.damage.critical
            }
            (false, true) => {
                bump(&mut self.count.lucky, 1);
                &mut self.damage.lucky
            }
            (false, false) => {
                bump(&mut self.count.normal, 1);
                &mut self.damage.normal
            }
        };
        bump(damage_bucket, damage);

        bump(&mut self.damage.total, damage);
        bump(&mut self.damage.hp_lessen, hp_lessen);
        bump(&mut self.count.total, 1);

        self.window.push_back((now, damage));

        if self.first_hit.is_none() {
            self.first_hit = Some(now);
        } else {
            self.last_hit = Some(now);
        }
    }

    fn sweep(&mut self, now: u64, window_ms: u64) {
        while let Some(&(t, _)) = self.window.front() {
            if now.saturating_sub(t) < window_ms {
                break;
            }
            self.window.pop_front();
        }
        self.window_max = self.window_max.max(self.live_sum(now, window_ms));
    }

    /// Windowed sum at `now` without mutating the window.
    fn live_sum(&self, now: u64, window_ms: u64) -> u64 {
        self.window
            .iter()
            .filter(|(t, _)| now.saturating_sub(*t) < window_ms)
            .fold(0u64, |sum, (_, damage)| sum.saturating_add(*damage))
    }

    fn total_dps(&self) -> f64 {
        match (self.first_hit, self.last_hit) {
            (Some(first), Some(last)) if last > first => {
                self.damage.total as f64 / ((last - first) as f64 / 1000.0)
            }
            _ => 0.0,
        }
    }

    fn view(&self, now: u64, window_ms: u64) -> PlayerStatView {
        let realtime = self.live_sum(now, window_ms);
        PlayerStatView {
            realtime_dps: realtime,
            realtime_dps_max: self.window_max.max(realtime),
            total_dps: self.total_dps(),
            total_damage: self.damage,
            total_count: self.count,
        }
    }
}

fn bump(counter: &mut u64, by: u64) {
    *counter = counter.saturating_add(by);
}

/// Per-player combat statistics for one session.
#[derive(Debug)]
pub struct Aggregator {
    players: Mutex<IndexMap<u64, PlayerStat>>,
    window_ms: u64,
}

impl Aggregator {
    pub fn new(window_ms: u64) -> Self {
        Self {
            players: Mutex::new(IndexMap::new()),
            window_ms,
        }
    }

    fn players(&self) -> MutexGuard<'_, IndexMap<u64, PlayerStat>> {
        self.players.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_hit(&self, uid: u64, damage: u64, crit: bool, lucky: bool, hp_lessen: u64, now: u64) {
        trace!(
            "[Stats] uid={} damage={} crit={} lucky={} hp_lessen={}",
            uid, damage, crit, lucky, hp_lessen
        );
        self.players()
            .entry(uid)
            .or_default()
            .record(damage, crit, lucky, hp_lessen, now);
    }

    /// Drops samples that left the window and raises the running maxima.
    pub fn sweep(&self, now: u64) {
        for stat in self.players().values_mut() {
            stat.sweep(now, self.window_ms);
        }
    }

    pub fn snapshot(&self, now: u64) -> Snapshot {
        let players = self
            .players()
            .iter()
            .map(|(uid, stat)| (*uid, stat.view(now, self.window_ms)))
            .collect();
        Snapshot { players }
    }

    pub fn clear(&self) {
        self.players().clear();
    }

    pub fn len(&self) -> usize {
        self.players().len()
    }

    pub fn is_empty(&self) -> bool {
        self.players().is_empty()
    }
}
