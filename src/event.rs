/// Typed game events extracted from EVE Online log lines.
///
/// Every event carries the timestamp of the line it came from, or the
/// tailer's discovery time when the line had none. Events are immutable
/// values: the engine evaluates each one once and keeps nothing beyond what
/// its own rule state records.
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Discriminant of [`EventPayload`]. Rules name the kinds they react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IncomingDamage,
    DroneDamage,
    ShieldLevel,
    CapacitorLevel,
    WarpScrambled,
    Webbed,
    CapacitorNeutralized,
    ModuleActivated,
    ModuleDeactivated,
    RoomCleared,
    WaveComplete,
    CargoApproach,
    ElapsedTimeMarker,
    EnemyAppeared,
}

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        Self::IncomingDamage,
        Self::DroneDamage,
        Self::ShieldLevel,
        Self::CapacitorLevel,
        Self::WarpScrambled,
        Self::Webbed,
        Self::CapacitorNeutralized,
        Self::ModuleActivated,
        Self::ModuleDeactivated,
        Self::RoomCleared,
        Self::WaveComplete,
        Self::CargoApproach,
        Self::ElapsedTimeMarker,
        Self::EnemyAppeared,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncomingDamage       => "incoming_damage",
            Self::DroneDamage          => "drone_damage",
            Self::ShieldLevel          => "shield_level",
            Self::CapacitorLevel       => "capacitor_level",
            Self::WarpScrambled        => "warp_scrambled",
            Self::Webbed               => "webbed",
            Self::CapacitorNeutralized => "capacitor_neutralized",
            Self::ModuleActivated      => "module_activated",
            Self::ModuleDeactivated    => "module_deactivated",
            Self::RoomCleared          => "room_cleared",
            Self::WaveComplete         => "wave_complete",
            Self::CargoApproach        => "cargo_approach",
            Self::ElapsedTimeMarker    => "elapsed_time_marker",
            Self::EnemyAppeared        => "enemy_appeared",
        }
    }

    /// Field names a message template may reference for this kind.
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Self::IncomingDamage    => &["amount", "source"],
            Self::DroneDamage       => &["amount"],
            Self::ShieldLevel       => &["percent"],
            Self::CapacitorLevel    => &["percent"],
            Self::ModuleActivated   => &["name"],
            Self::ModuleDeactivated => &["name"],
            Self::ElapsedTimeMarker => &["minutes"],
            Self::EnemyAppeared     => &["name", "threat_score"],
            Self::WarpScrambled
            | Self::Webbed
            | Self::CapacitorNeutralized
            | Self::RoomCleared
            | Self::WaveComplete
            | Self::CargoApproach => &[],
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields().contains(&name)
    }

    /// True when events of this kind carry a primary numeric value
    /// (see [`GameEvent::magnitude`]).
    pub fn has_magnitude(&self) -> bool {
        matches!(
            self,
            Self::IncomingDamage
                | Self::DroneDamage
                | Self::ShieldLevel
                | Self::CapacitorLevel
                | Self::ElapsedTimeMarker
                | Self::EnemyAppeared
        )
    }

    /// Kinds whose magnitude is a percentage in [0, 100].
    pub fn is_percent(&self) -> bool {
        matches!(self, Self::ShieldLevel | Self::CapacitorLevel)
    }

    pub fn has_amount(&self) -> bool {
        matches!(self, Self::IncomingDamage | Self::DroneDamage)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload + event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    IncomingDamage    { amount: u64, source: String },
    DroneDamage       { amount: u64 },
    ShieldLevel       { percent: f64 },
    CapacitorLevel    { percent: f64 },
    WarpScrambled,
    Webbed,
    CapacitorNeutralized,
    ModuleActivated   { name: String },
    ModuleDeactivated { name: String },
    RoomCleared,
    WaveComplete,
    CargoApproach,
    ElapsedTimeMarker { minutes: u32 },
    EnemyAppeared     { name: String, threat_score: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    /// Milliseconds since the Unix epoch (UTC).
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl GameEvent {
    pub fn new(timestamp_ms: u64, payload: EventPayload) -> Self {
        Self { timestamp_ms, payload }
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::IncomingDamage { .. }    => EventKind::IncomingDamage,
            EventPayload::DroneDamage { .. }       => EventKind::DroneDamage,
            EventPayload::ShieldLevel { .. }       => EventKind::ShieldLevel,
            EventPayload::CapacitorLevel { .. }    => EventKind::CapacitorLevel,
            EventPayload::WarpScrambled            => EventKind::WarpScrambled,
            EventPayload::Webbed                   => EventKind::Webbed,
            EventPayload::CapacitorNeutralized     => EventKind::CapacitorNeutralized,
            EventPayload::ModuleActivated { .. }   => EventKind::ModuleActivated,
            EventPayload::ModuleDeactivated { .. } => EventKind::ModuleDeactivated,
            EventPayload::RoomCleared              => EventKind::RoomCleared,
            EventPayload::WaveComplete             => EventKind::WaveComplete,
            EventPayload::CargoApproach            => EventKind::CargoApproach,
            EventPayload::ElapsedTimeMarker { .. } => EventKind::ElapsedTimeMarker,
            EventPayload::EnemyAppeared { .. }     => EventKind::EnemyAppeared,
        }
    }

    /// The primary numeric value threshold triggers compare against.
    pub fn magnitude(&self) -> Option<f64> {
        match &self.payload {
            EventPayload::IncomingDamage { amount, .. } => Some(*amount as f64),
            EventPayload::DroneDamage { amount }        => Some(*amount as f64),
            EventPayload::ShieldLevel { percent }       => Some(*percent),
            EventPayload::CapacitorLevel { percent }    => Some(*percent),
            EventPayload::ElapsedTimeMarker { minutes } => Some(f64::from(*minutes)),
            EventPayload::EnemyAppeared { threat_score, .. } => Some(*threat_score),
            _ => None,
        }
    }

    pub fn amount(&self) -> Option<u64> {
        match &self.payload {
            EventPayload::IncomingDamage { amount, .. } | EventPayload::DroneDamage { amount } => {
                Some(*amount)
            }
            _ => None,
        }
    }

    /// Render a named field for message templates. `None` when this kind has
    /// no such field.
    pub fn field(&self, name: &str) -> Option<String> {
        match (&self.payload, name) {
            (EventPayload::IncomingDamage { amount, .. }, "amount") => Some(amount.to_string()),
            (EventPayload::IncomingDamage { source, .. }, "source") => Some(source.clone()),
            (EventPayload::DroneDamage { amount }, "amount")        => Some(amount.to_string()),
            (EventPayload::ShieldLevel { percent }, "percent")      => Some(format_number(*percent)),
            (EventPayload::CapacitorLevel { percent }, "percent")   => Some(format_number(*percent)),
            (EventPayload::ModuleActivated { name }, "name")        => Some(name.clone()),
            (EventPayload::ModuleDeactivated { name }, "name")      => Some(name.clone()),
            (EventPayload::ElapsedTimeMarker { minutes }, "minutes") => Some(minutes.to_string()),
            (EventPayload::EnemyAppeared { name, .. }, "name")      => Some(name.clone()),
            (EventPayload::EnemyAppeared { threat_score, .. }, "threat_score") => {
                Some(format_number(*threat_score))
            }
            _ => None,
        }
    }
}

/// Whole numbers render without a fractional part ("45", not "45.0"); other
/// values keep one decimal.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.1}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_lists_only_fields_it_can_render() {
        let samples = [
            EventPayload::IncomingDamage { amount: 150, source: "Enemy".into() },
            EventPayload::DroneDamage { amount: 62 },
            EventPayload::ShieldLevel { percent: 45.0 },
            EventPayload::CapacitorLevel { percent: 12.5 },
            EventPayload::WarpScrambled,
            EventPayload::Webbed,
            EventPayload::CapacitorNeutralized,
            EventPayload::ModuleActivated { name: "Shield Booster II".into() },
            EventPayload::ModuleDeactivated { name: "Shield Booster II".into() },
            EventPayload::RoomCleared,
            EventPayload::WaveComplete,
            EventPayload::CargoApproach,
            EventPayload::ElapsedTimeMarker { minutes: 15 },
            EventPayload::EnemyAppeared { name: "Damavik".into(), threat_score: 90.0 },
        ];
        assert_eq!(samples.len(), EventKind::ALL.len());

        for payload in samples {
            let event = GameEvent::new(0, payload);
            let kind = event.kind();
            for field in kind.fields() {
                assert!(event.field(field).is_some(), "{} should render {}", kind, field);
            }
            assert!(event.field("nonexistent").is_none());
            assert_eq!(kind.has_magnitude(), event.magnitude().is_some(), "{}", kind);
            assert_eq!(kind.has_amount(), event.amount().is_some(), "{}", kind);
        }
    }

    #[test]
    fn numbers_render_without_trailing_zero() {
        assert_eq!(format_number(45.0), "45");
        assert_eq!(format_number(12.5), "12.5");
        assert_eq!(format_number(0.0), "0");
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = GameEvent::new(
            1_000,
            EventPayload::IncomingDamage { amount: 150, source: "Enemy".into() },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "IncomingDamage");
        assert_eq!(json["amount"], 150);
        assert_eq!(json["timestamp_ms"], 1_000);

        let back: GameEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn kinds_use_snake_case_names() {
        let kinds: Vec<EventKind> =
            serde_json::from_str(r#"["incoming_damage","enemy_appeared"]"#).unwrap();
        assert_eq!(kinds, vec![EventKind::IncomingDamage, EventKind::EnemyAppeared]);
        for kind in EventKind::ALL {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
    }
}
