/// Parses raw EVE Online game log lines into typed [`GameEvent`]s.
///
/// Game log line shapes (combat channel of `Gamelogs/*.txt`):
///
///   [ 2024.01.01 12:00:00 ] (combat) <color=0xffcc0000><b>150</b> <font size=10>from</font> <b>Enemy</b> - Hits
///   2025.01.28 14:30:16  You take 45 Thermal damage from Damavik
///   Shields at 45%
///
/// Each line is normalised first: the optional timestamp prefix is split off
/// (bracketed or bare, `.` or `-` date separators), the `<...>` markup the
/// client embeds is removed, a leading `(combat)` style channel tag is dropped
/// and whitespace is collapsed. The remaining message is tried against
/// [`MATCHERS`] in order; the first matcher whose pattern matches *and* whose
/// builder accepts the captures wins. A builder that rejects its captures
/// (unparsable number, empty name) lets the next matcher try.
///
/// Parsing is total and stateless: any input yields `Some(event)` or `None`.
use crate::event::{EventPayload, GameEvent};
use crate::tailer::RawLine;
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

// ---------------------------------------------------------------------------
// Matcher table
// ---------------------------------------------------------------------------

struct Matcher {
    name:    &'static str,
    pattern: Regex,
    build:   fn(&Captures) -> Option<EventPayload>,
}

fn matcher(
    name:    &'static str,
    pattern: &str,
    build:   fn(&Captures) -> Option<EventPayload>,
) -> Matcher {
    Matcher {
        name,
        pattern: Regex::new(pattern).expect("built-in log pattern must compile"),
        build,
    }
}

/// Ordered: more specific phrasings come before the generic ones they overlap.
static MATCHERS: Lazy<Vec<Matcher>> = Lazy::new(|| {
    vec![
        matcher(
            "drone_damage",
            r"(?i)^your (?P<drone>.+?) (?:has taken|takes|took) (?P<amount>[\d,]+) (?:\w+ )?damage\b",
            build_drone_damage,
        ),
        matcher(
            "incoming_damage",
            r"(?i)^you are being hit by (?P<source>.+?) for (?P<amount>[\d,]+)(?: \w+)? damage\b",
            build_incoming_damage,
        ),
        matcher(
            "incoming_damage",
            r"(?i)^you (?:take|took) (?P<amount>[\d,]+) (?:\w+ )?damage from (?P<source>.+?)\.?$",
            build_incoming_damage,
        ),
        matcher(
            "incoming_damage",
            r"(?i)^(?P<amount>[\d,]+) from (?P<source>.+?)(?: - .*)?$",
            build_incoming_damage,
        ),
        matcher(
            "warp_scrambled",
            r"(?i)^(?:you are (?:being )?warp (?:scrambled|disrupted) by\b|warp (?:scramble|disruption) attempt from\b.*\bto you\b)",
            |_| Some(EventPayload::WarpScrambled),
        ),
        matcher(
            "webbed",
            r"(?i)^you are (?:being )?webbed by\b|\bstasis webifier\b.*\byou\b",
            |_| Some(EventPayload::Webbed),
        ),
        matcher(
            "capacitor_neutralized",
            r"(?i)\bGJ (?:of )?energy neutralized\b|^your capacitor is being neutralized\b",
            |_| Some(EventPayload::CapacitorNeutralized),
        ),
        matcher(
            "shield_level",
            r"(?i)^shields? (?:at|level:?) (?P<value>-?[\d.]+) ?%",
            |caps| Some(EventPayload::ShieldLevel { percent: percent(caps)? }),
        ),
        matcher(
            "capacitor_level",
            r"(?i)^capacitor (?:at|level:?) (?P<value>-?[\d.]+) ?%",
            |caps| Some(EventPayload::CapacitorLevel { percent: percent(caps)? }),
        ),
        matcher(
            "module_deactivated",
            r"(?i)^your (?P<name>.+?) (?:deactivates|is deactivated|deactivated)\.?$",
            |caps| Some(EventPayload::ModuleDeactivated { name: name(caps, "name")? }),
        ),
        matcher(
            "module_activated",
            r"(?i)^your (?P<name>.+?) (?:activates|is activated|activated)\.?$",
            |caps| Some(EventPayload::ModuleActivated { name: name(caps, "name")? }),
        ),
        matcher(
            "room_cleared",
            r"(?i)^(?:(?:room|pocket) cleared|all hostiles destroyed)\b",
            |_| Some(EventPayload::RoomCleared),
        ),
        matcher(
            "wave_complete",
            r"(?i)^wave(?: \d+)? complete\b",
            |_| Some(EventPayload::WaveComplete),
        ),
        matcher(
            "cargo_approach",
            r"(?i)^approaching (?:the )?(?:bioadaptive cache|cargo|cache)\b",
            |_| Some(EventPayload::CargoApproach),
        ),
        matcher(
            "elapsed_time_marker",
            r"(?i)^(?P<minutes>\d+) minutes? elapsed\b",
            build_elapsed,
        ),
        matcher(
            "elapsed_time_marker",
            r"(?i)^time elapsed:? (?P<minutes>\d+) minutes?\b",
            build_elapsed,
        ),
        matcher(
            "enemy_appeared",
            r"(?i)^(?:hostile|enemy) (?:spotted|appeared|on grid):? (?P<name>.+?)(?: ?\(threat (?P<score>[^)]*)\))?$",
            build_enemy,
        ),
    ]
});

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

fn amount(caps: &Captures) -> Option<u64> {
    let digits: String = caps.name("amount")?.as_str().chars().filter(|c| *c != ',').collect();
    digits.parse().ok()
}

fn percent(caps: &Captures) -> Option<f64> {
    let value: f64 = caps.name("value")?.as_str().parse().ok()?;
    value.is_finite().then(|| value.clamp(0.0, 100.0))
}

fn name(caps: &Captures, group: &str) -> Option<String> {
    let text = caps.name(group)?.as_str().trim();
    (!text.is_empty()).then(|| text.to_owned())
}

fn build_drone_damage(caps: &Captures) -> Option<EventPayload> {
    Some(EventPayload::DroneDamage { amount: amount(caps)? })
}

fn build_incoming_damage(caps: &Captures) -> Option<EventPayload> {
    Some(EventPayload::IncomingDamage {
        amount: amount(caps)?,
        source: name(caps, "source")?,
    })
}

fn build_elapsed(caps: &Captures) -> Option<EventPayload> {
    let minutes = caps.name("minutes")?.as_str().parse().ok()?;
    Some(EventPayload::ElapsedTimeMarker { minutes })
}

fn build_enemy(caps: &Captures) -> Option<EventPayload> {
    let name = name(caps, "name")?;
    let threat_score = match caps.name("score") {
        Some(score) => {
            let value: f64 = score.as_str().trim().parse().ok()?;
            if !value.is_finite() || value < 0.0 {
                return None;
            }
            value
        }
        None => threat_score_for(&name),
    };
    Some(EventPayload::EnemyAppeared { name, threat_score })
}

// ---------------------------------------------------------------------------
// Threat heuristic
// ---------------------------------------------------------------------------

/// Known Abyssal hostiles, most dangerous first. Matched case-insensitively
/// as substrings of the enemy name.
const THREAT_KEYWORDS: &[(&str, f64)] = &[
    // Triglavian
    ("damavik",     90.0),
    ("kikimora",    90.0),
    ("tessella",    90.0),
    ("devoted",     90.0),
    ("torchbearer", 90.0),
    ("hunter",      90.0),
    ("knight",      90.0),
    // Drifter
    ("drifter",     70.0),
    // Rogue drones and pirate factions
    ("rogue",       40.0),
    ("pirate",      40.0),
    ("sansha",      40.0),
    ("blood",       40.0),
    ("angel",       40.0),
];

pub const UNKNOWN_THREAT_SCORE: f64 = 10.0;

/// Threat score for an enemy that was announced without an explicit one.
pub fn threat_score_for(name: &str) -> f64 {
    let lower = name.to_lowercase();
    THREAT_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, score)| *score)
        .unwrap_or(UNKNOWN_THREAT_SCORE)
}

// ---------------------------------------------------------------------------
// Line normalisation
// ---------------------------------------------------------------------------

static TIMESTAMP_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\[?\s*(?P<ts>\d{4}[.\-]\d{2}[.\-]\d{2}[ T]\d{2}:\d{2}:\d{2})\s*\]?\s*")
        .expect("timestamp pattern must compile")
});

static MARKUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^<>]*>").expect("markup pattern must compile"));

static CHANNEL_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\((?:combat|notify|hint|info|question|warning)\)\s*")
        .expect("channel pattern must compile")
});

static WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern must compile"));

/// Parse a log timestamp (`2024.01.01 12:00:00` or `2024-01-01 12:00:00`,
/// always UTC in game logs) into epoch milliseconds.
pub fn parse_timestamp(text: &str) -> Option<u64> {
    let normalised = text.replace('-', ".").replace('T', " ");
    let dt = NaiveDateTime::parse_from_str(&normalised, "%Y.%m.%d %H:%M:%S").ok()?;
    u64::try_from(dt.and_utc().timestamp_millis()).ok()
}

/// Split a line into its timestamp (if any) and the bare message text.
fn normalise(raw: &str) -> (Option<u64>, String) {
    let (timestamp_ms, rest) = match TIMESTAMP_PREFIX.captures(raw) {
        Some(caps) => {
            let end = caps.get(0).map_or(0, |m| m.end());
            (caps.name("ts").and_then(|ts| parse_timestamp(ts.as_str())), &raw[end..])
        }
        None => (None, raw),
    };

    let unmarked = MARKUP.replace_all(rest, "");
    let collapsed = WHITESPACE.replace_all(unmarked.trim(), " ");
    let message = CHANNEL_TAG.replace(&collapsed, "").trim().to_owned();
    (timestamp_ms, message)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Turn one raw line into at most one event. Lines without a usable
/// timestamp take the tailer's discovery time.
pub fn parse_line(line: &RawLine) -> Option<GameEvent> {
    let (timestamp_ms, message) = normalise(&line.text);
    if message.is_empty() {
        return None;
    }

    for m in MATCHERS.iter() {
        let Some(caps) = m.pattern.captures(&message) else {
            continue;
        };
        match (m.build)(&caps) {
            Some(payload) => {
                return Some(GameEvent::new(
                    timestamp_ms.unwrap_or(line.discovered_at_ms),
                    payload,
                ));
            }
            None => {
                tracing::debug!("Matcher {} rejected captures in {:?}", m.name, message);
            }
        }
    }
    None
}

/// Names of the matchers in evaluation order (diagnostics and tests).
pub fn matcher_names() -> Vec<&'static str> {
    MATCHERS.iter().map(|m| m.name).collect()
}
