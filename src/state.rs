/// Runtime state owned by the engine: per-rule counters and timers, the
/// set of active modules, and the ranked board of known enemies.
///
/// Everything here is plain data mutated by a single owner (the engine's
/// evaluation step), so no locking is needed.
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

// ---------------------------------------------------------------------------
// Rolling damage window
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleWindow {
    /// (timestamp_ms, amount) pairs inside the current window.
    samples: VecDeque<(u64, u64)>,
    total:   u64,
}

impl SampleWindow {
    /// Add a sample, drop everything older than `window_ms` before `now_ms`,
    /// and return the sum of what remains.
    pub fn record(&mut self, now_ms: u64, amount: u64, window_ms: u64) -> u64 {
        self.samples.push_back((now_ms, amount));
        self.total = self.total.saturating_add(amount);
        self.prune(now_ms, window_ms);
        self.total
    }

    fn prune(&mut self, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        if self.samples.iter().all(|(ts, _)| *ts >= cutoff) {
            return;
        }
        self.samples.retain(|(ts, _)| *ts >= cutoff);
        self.total = self.samples.iter().map(|(_, amt)| *amt).sum();
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.total = 0;
    }
}

// ---------------------------------------------------------------------------
// Per-rule state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleState {
    pub last_fired_ms:     Option<u64>,
    /// Matching events since the last room reset (hit_count rules).
    pub consecutive_count: u32,
    /// Current windowed sum (windowed_sum rules).
    pub accumulator:       u64,
    pub samples:           SampleWindow,
    /// Last magnitude seen by a threshold rule.
    pub last_level:        Option<f64>,
    pub trigger_count:     u64,
}

impl RuleState {
    /// True when a rule with `cooldown_ms` may fire at `now_ms`.
    pub fn cooldown_elapsed(&self, now_ms: u64, cooldown_ms: u64) -> bool {
        match self.last_fired_ms {
            None       => true,
            Some(last) => now_ms.saturating_sub(last) >= cooldown_ms,
        }
    }

    pub fn mark_fired(&mut self, now_ms: u64) {
        self.last_fired_ms = Some(now_ms);
        self.trigger_count += 1;
    }

    /// Encounter boundary: counters go back to zero, the cooldown timer and
    /// the lifetime trigger count stay.
    pub fn reset_room(&mut self) {
        self.consecutive_count = 0;
        self.accumulator       = 0;
        self.samples.clear();
    }
}

// ---------------------------------------------------------------------------
// Module activity
// ---------------------------------------------------------------------------

/// Modules currently running, keyed case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ModuleTracker {
    active: BTreeMap<String, String>,
}

impl ModuleTracker {
    pub fn activate(&mut self, name: &str) {
        self.active.insert(name.to_lowercase(), name.to_owned());
    }

    pub fn deactivate(&mut self, name: &str) {
        self.active.remove(&name.to_lowercase());
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.contains_key(&name.to_lowercase())
    }

    pub fn active(&self) -> Vec<String> {
        self.active.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}

// ---------------------------------------------------------------------------
// Threat board
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreatEntry {
    pub name:         String,
    pub threat_score: f64,
    pub last_seen_ms: u64,
    /// Recency rank; larger is more recent.
    #[serde(skip)]
    seen_seq:         u64,
}

impl ThreatEntry {
    /// Lowest score first, then oldest first.
    fn rank_cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.threat_score
            .total_cmp(&other.threat_score)
            .then(self.seen_seq.cmp(&other.seen_seq))
    }
}

/// Bounded set of enemies on grid, ranked by threat score then recency.
#[derive(Debug, Clone)]
pub struct ThreatBoard {
    capacity: usize,
    entries:  Vec<ThreatEntry>,
    next_seq: u64,
}

impl ThreatBoard {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Vec::with_capacity(capacity), next_seq: 0 }
    }

    /// Record a sighting. A known name gets its score and recency refreshed.
    /// On a full board the weakest entry makes room, unless the newcomer
    /// ranks below all of them; returns false when it was dropped.
    pub fn observe(&mut self, name: &str, threat_score: f64, seen_ms: u64) -> bool {
        self.next_seq += 1;
        let seen_seq = self.next_seq;

        if let Some(entry) = self.entries.iter_mut().find(|e| e.name == name) {
            entry.threat_score = threat_score;
            entry.last_seen_ms = seen_ms;
            entry.seen_seq     = seen_seq;
            return true;
        }

        let newcomer = ThreatEntry {
            name: name.to_owned(),
            threat_score,
            last_seen_ms: seen_ms,
            seen_seq,
        };

        if self.entries.len() < self.capacity {
            self.entries.push(newcomer);
            return true;
        }

        let weakest = self
            .entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.rank_cmp(b))
            .map(|(i, _)| i);

        match weakest {
            Some(i) if newcomer.rank_cmp(&self.entries[i]).is_gt() => {
                tracing::debug!(
                    "Threat board full, evicting {} for {}",
                    self.entries[i].name,
                    newcomer.name
                );
                self.entries[i] = newcomer;
                true
            }
            _ => false,
        }
    }

    /// Highest threat, most recent on ties.
    pub fn top(&self) -> Option<&ThreatEntry> {
        self.entries.iter().max_by(|a, b| a.rank_cmp(b))
    }

    /// Entries from most to least threatening.
    pub fn ranked(&self) -> Vec<ThreatEntry> {
        let mut ranked = self.entries.clone();
        ranked.sort_by(|a, b| b.rank_cmp(a));
        ranked
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
