/// Rule evaluator, the "brain" of the pipeline.
///
/// For every event the engine first applies world updates (room and wave
/// resets, module activity, threat board), then walks the rule set in
/// configuration order. A rule that listens to the event's kind updates its
/// state, checks its trigger predicate, then its module gate, then its
/// cooldown; only a rule passing all three produces a notification.
///
/// Notifications from one event come back sorted by descending priority,
/// configuration order breaking ties.
use crate::{
    event::{format_number, EventKind, EventPayload, GameEvent},
    rules::{RuleSet, Trigger},
    state::{ModuleTracker, RuleState, ThreatBoard, ThreatEntry},
};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub rule_id:      String,
    pub message:      String,
    /// Higher is more urgent.
    pub priority:     i32,
    pub event_kind:   EventKind,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub threat_board_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { threat_board_capacity: 8 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleStatus {
    pub id:                String,
    pub enabled:           bool,
    pub trigger:           &'static str,
    pub trigger_count:     u64,
    pub last_fired_ms:     Option<u64>,
    pub consecutive_count: u32,
    pub accumulator:       u64,
    pub last_level:        Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub rules:                 usize,
    pub enabled_rules:         usize,
    pub active_modules:        Vec<String>,
    pub threats:               Vec<ThreatEntry>,
    pub events_evaluated:      u64,
    pub notifications_emitted: u64,
}

// ---------------------------------------------------------------------------
// Trigger-derived template fields
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Derived {
    count:  Option<u32>,
    total:  Option<u64>,
    target: Option<(String, f64)>,
}

impl Derived {
    fn get(&self, field: &str) -> Option<String> {
        match field {
            "count"         => self.count.map(|c| c.to_string()),
            "total"         => self.total.map(|t| t.to_string()),
            "target"        => self.target.as_ref().map(|(name, _)| name.clone()),
            "target_threat" => self.target.as_ref().map(|(_, score)| format_number(*score)),
            _ => None,
        }
    }
}

/// Update `state` from `event` and evaluate the trigger predicate.
/// `Some` means the predicate holds.
fn update_and_check(
    trigger: &Trigger,
    state:   &mut RuleState,
    event:   &GameEvent,
    now_ms:  u64,
    threats: &ThreatBoard,
) -> Option<Derived> {
    match trigger {
        Trigger::Always => Some(Derived::default()),

        Trigger::Below { threshold } => {
            let level = event.magnitude()?;
            state.last_level = Some(level);
            (level < *threshold).then(Derived::default)
        }

        Trigger::AtLeast { threshold } => {
            let level = event.magnitude()?;
            state.last_level = Some(level);
            (level >= *threshold).then(Derived::default)
        }

        Trigger::HitCount { min_hits, max_hits } => {
            state.consecutive_count = state.consecutive_count.saturating_add(1);
            let count = state.consecutive_count;
            let in_range = count >= *min_hits && max_hits.map_or(true, |max| count <= max);
            in_range.then(|| Derived { count: Some(count), ..Default::default() })
        }

        Trigger::WindowedSum { min_total, window_ms } => {
            let amount = event.amount()?;
            let total = state.samples.record(now_ms, amount, *window_ms);
            state.accumulator = total;
            (total >= *min_total).then(|| Derived { total: Some(total), ..Default::default() })
        }

        Trigger::TargetRecommendation => threats.top().map(|top| Derived {
            target: Some((top.name.clone(), top.threat_score)),
            ..Default::default()
        }),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    rules:                 RuleSet,
    states:                HashMap<String, RuleState>,
    modules:               ModuleTracker,
    threats:               ThreatBoard,
    settings:              EngineSettings,
    events_evaluated:      u64,
    notifications_emitted: u64,
}

impl Engine {
    pub fn new(rules: RuleSet, settings: EngineSettings) -> Self {
        let states = fresh_states(&rules);
        Self {
            rules,
            states,
            modules:               ModuleTracker::default(),
            threats:               ThreatBoard::new(settings.threat_board_capacity),
            settings,
            events_evaluated:      0,
            notifications_emitted: 0,
        }
    }

    /// Full reset with a new rule snapshot (profile switch).
    pub fn reset(&mut self, rules: RuleSet) {
        tracing::info!("Engine reset with {} rule(s)", rules.len());
        *self = Self::new(rules, self.settings);
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn rule_state(&self, id: &str) -> Option<&RuleState> {
        self.states.get(id)
    }

    /// Evaluate one event. `now_ms` is the event's logical time.
    pub fn evaluate(&mut self, event: &GameEvent, now_ms: u64) -> Vec<NotificationRequest> {
        self.events_evaluated += 1;
        self.apply_world_update(event);

        let kind = event.kind();
        let mut fired = Vec::new();

        for rule in self.rules.rules() {
            if !rule.config.enabled || !rule.listens_to(kind) {
                continue;
            }
            let Some(state) = self.states.get_mut(rule.id()) else {
                continue;
            };

            let Some(derived) = update_and_check(&rule.config.trigger, state, event, now_ms, &self.threats)
            else {
                continue;
            };

            if let Some(module) = &rule.config.unless_module_active {
                if self.modules.is_active(module) {
                    tracing::debug!("Rule {} gated: {} is active", rule.id(), module);
                    continue;
                }
            }

            if !state.cooldown_elapsed(now_ms, rule.config.cooldown_ms) {
                tracing::debug!("Rule {} suppressed by cooldown", rule.id());
                continue;
            }
            state.mark_fired(now_ms);

            let message = rule
                .template
                .render(|field| derived.get(field).or_else(|| event.field(field)));

            fired.push(NotificationRequest {
                rule_id:      rule.id().to_owned(),
                message,
                priority:     rule.config.priority,
                event_kind:   kind,
                timestamp_ms: now_ms,
            });
        }

        // Stable sort keeps configuration order among equal priorities.
        fired.sort_by_key(|n| Reverse(n.priority));
        self.notifications_emitted += fired.len() as u64;

        for n in &fired {
            tracing::info!("Rule {} fired (priority {}): {}", n.rule_id, n.priority, n.message);
        }
        fired
    }

    /// Resets and trackers that every event may drive, applied before any
    /// rule sees the event.
    fn apply_world_update(&mut self, event: &GameEvent) {
        match &event.payload {
            EventPayload::RoomCleared => {
                for rule in self.rules.rules() {
                    if !rule.config.room_scoped {
                        continue;
                    }
                    if let Some(state) = self.states.get_mut(rule.id()) {
                        state.reset_room();
                    }
                }
                self.threats.clear();
                tracing::info!("Room cleared, room-scoped counters and threat board reset");
            }
            EventPayload::WaveComplete => {
                self.modules.clear();
                tracing::debug!("Wave complete, module tracking cleared");
            }
            EventPayload::ModuleActivated { name } => self.modules.activate(name),
            EventPayload::ModuleDeactivated { name } => self.modules.deactivate(name),
            EventPayload::EnemyAppeared { name, threat_score } => {
                if !self.threats.observe(name, *threat_score, event.timestamp_ms) {
                    tracing::debug!("Threat board full, ignoring {}", name);
                }
            }
            _ => {}
        }
    }

    pub fn rule_status(&self) -> Vec<RuleStatus> {
        self.rules
            .rules()
            .iter()
            .map(|rule| {
                let state = self.states.get(rule.id()).cloned().unwrap_or_default();
                RuleStatus {
                    id:                rule.id().to_owned(),
                    enabled:           rule.config.enabled,
                    trigger:           rule.config.trigger.name(),
                    trigger_count:     state.trigger_count,
                    last_fired_ms:     state.last_fired_ms,
                    consecutive_count: state.consecutive_count,
                    accumulator:       state.accumulator,
                    last_level:        state.last_level,
                }
            })
            .collect()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            rules:                 self.rules.len(),
            enabled_rules:         self.rules.enabled_count(),
            active_modules:        self.modules.active(),
            threats:               self.threats.ranked(),
            events_evaluated:      self.events_evaluated,
            notifications_emitted: self.notifications_emitted,
        }
    }
}

fn fresh_states(rules: &RuleSet) -> HashMap<String, RuleState> {
    rules
        .rules()
        .iter()
        .map(|r| (r.id().to_owned(), RuleState::default()))
        .collect()
}
