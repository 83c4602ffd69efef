//! End-to-end behaviour through the public API: log lines in, notification
//! requests out.

use eve_copilot_lib::{
    engine::{Engine, EngineSettings, NotificationRequest},
    event::{EventKind, EventPayload, GameEvent},
    parser,
    pipeline::{Pipeline, PipelineSettings},
    rules::{RuleConfig, RuleSet, Trigger},
    tailer::{RawLine, TailerState},
};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

/// 2024-01-01 12:00:00 UTC
const NOON: u64 = 1_704_110_400_000;

fn damage_spike() -> RuleConfig {
    RuleConfig::new(
        "damage_spike",
        &[EventKind::IncomingDamage],
        Trigger::HitCount { min_hits: 1, max_hits: Some(1) },
        "Damage spike!",
    )
    .with_cooldown(30_000)
    .with_priority(9)
}

fn shield_low() -> RuleConfig {
    RuleConfig::new(
        "shield_low",
        &[EventKind::ShieldLevel],
        Trigger::Below { threshold: 50.0 },
        "Shield low, {percent} percent",
    )
    .with_cooldown(10_000)
    .with_priority(10)
}

fn engine(rules: Vec<RuleConfig>) -> Engine {
    Engine::new(RuleSet::compile(rules).unwrap(), EngineSettings::default())
}

fn parse(text: &str) -> GameEvent {
    parser::parse_line(&RawLine::new(text, 0))
        .unwrap_or_else(|| panic!("line should parse: {text}"))
}

fn hit(at_ms: u64) -> GameEvent {
    GameEvent::new(
        at_ms,
        EventPayload::IncomingDamage { amount: 150, source: "Enemy".into() },
    )
}

fn feed(engine: &mut Engine, event: &GameEvent) -> Vec<NotificationRequest> {
    engine.evaluate(event, event.timestamp_ms)
}

fn messages(requests: &[NotificationRequest]) -> Vec<(&str, i32)> {
    requests.iter().map(|r| (r.message.as_str(), r.priority)).collect()
}

#[test]
fn first_hit_in_a_room_announces_a_damage_spike() {
    let event = parse("2024.01.01 12:00:00 You are being hit by Enemy for 150 damage");
    assert_eq!(event.timestamp_ms, NOON);
    assert_eq!(
        event.payload,
        EventPayload::IncomingDamage { amount: 150, source: "Enemy".into() }
    );

    let mut engine = engine(vec![damage_spike()]);
    let out = feed(&mut engine, &event);
    assert_eq!(messages(&out), vec![("Damage spike!", 9)]);
    assert_eq!(out[0].rule_id, "damage_spike");
}

#[test]
fn second_hit_inside_the_cooldown_is_suppressed() {
    let mut engine = engine(vec![damage_spike()]);
    let first = parse("2024.01.01 12:00:00 You are being hit by Enemy for 150 damage");
    let second = parse("2024.01.01 12:00:05 You are being hit by Enemy for 150 damage");

    assert_eq!(feed(&mut engine, &first).len(), 1);
    assert!(feed(&mut engine, &second).is_empty());
}

#[test]
fn shield_threshold_re_fires_after_recovery_and_cooldown() {
    let mut engine = engine(vec![shield_low()]);

    let out = feed(&mut engine, &parse("2024.01.01 12:00:00 Shield at 45%"));
    assert_eq!(messages(&out), vec![("Shield low, 45 percent", 10)]);

    assert!(feed(&mut engine, &parse("2024.01.01 12:00:04 Shield at 70%")).is_empty());

    let out = feed(&mut engine, &parse("2024.01.01 12:00:12 Shield at 40%"));
    assert_eq!(messages(&out), vec![("Shield low, 40 percent", 10)]);

    let state = engine.rule_state("shield_low").unwrap();
    assert_eq!(state.trigger_count, 2);
    assert_eq!(state.last_level, Some(40.0));
}

#[test]
fn room_cleared_turns_the_next_hit_back_into_a_first_hit() {
    // Without a room boundary, a hit after the cooldown is still the 2nd
    // hit of the room and stays quiet.
    let mut no_reset = engine(vec![damage_spike()]);
    assert_eq!(feed(&mut no_reset, &hit(NOON)).len(), 1);
    assert!(feed(&mut no_reset, &hit(NOON + 40_000)).is_empty());
    assert_eq!(no_reset.rule_state("damage_spike").unwrap().consecutive_count, 2);

    // With one, the counter is back to zero and the same hit fires.
    let mut engine = engine(vec![damage_spike()]);
    assert_eq!(feed(&mut engine, &hit(NOON)).len(), 1);

    let cleared = parse("2024.01.01 12:00:35 Pocket cleared");
    assert_eq!(cleared.kind(), EventKind::RoomCleared);
    assert!(feed(&mut engine, &cleared).is_empty());
    assert_eq!(engine.rule_state("damage_spike").unwrap().consecutive_count, 0);

    let out = feed(&mut engine, &hit(NOON + 40_000));
    assert_eq!(messages(&out), vec![("Damage spike!", 9)]);
    assert_eq!(engine.rule_state("damage_spike").unwrap().consecutive_count, 1);
}

#[test]
fn room_cleared_does_not_bypass_a_running_cooldown() {
    let mut engine = engine(vec![damage_spike()]);
    assert_eq!(feed(&mut engine, &hit(NOON)).len(), 1);
    feed(&mut engine, &GameEvent::new(NOON + 1_000, EventPayload::RoomCleared));

    // First hit of the new room, but still inside the 30 s timer.
    assert!(feed(&mut engine, &hit(NOON + 2_000)).is_empty());
}

/// A log line padded with trailing spaces to exactly `width` bytes,
/// newline included.
fn padded(line: &str, width: usize) -> String {
    assert!(line.len() < width);
    format!("{line:<w$}\n", w = width - 1)
}

#[tokio::test]
async fn replaced_log_is_read_again_from_the_start() {
    let mut log = NamedTempFile::new().unwrap();
    let mut original = padded("2024.01.01 12:00:00 You are being hit by Enemy for 150 damage", 100);
    for _ in 0..99 {
        original.push_str(&padded("2024.01.01 12:00:01 (notify) Nothing of interest here", 100));
    }
    assert_eq!(original.len(), 10_000);
    log.write_all(original.as_bytes()).unwrap();
    log.flush().unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let settings = PipelineSettings {
        poll_interval:    Duration::from_millis(50),
        read_timeout:     Duration::from_secs(5),
        max_event_age_ms: None,
    };
    let mut pipeline = Pipeline::new(
        TailerState::new(log.path(), false),
        engine(vec![damage_spike(), shield_low()]),
        tx,
        settings,
    );

    let report = pipeline.run_cycle_at(NOON).await;
    assert_eq!((report.lines, report.events, report.notifications), (100, 1, 1));
    assert_eq!(rx.try_recv().unwrap().message, "Damage spike!");
    assert_eq!(pipeline.tailer().position().unwrap().offset, 10_000);

    // The game starts a fresh 200 byte log under the same name.
    let replacement = padded("2024.01.01 12:10:00 Room cleared", 100)
        + &padded("2024.01.01 12:10:01 You are being hit by Enemy for 150 damage", 100);
    assert_eq!(replacement.len(), 200);
    std::fs::write(log.path(), replacement).unwrap();

    let report = pipeline.run_cycle_at(NOON + 601_000).await;
    assert!(!report.poll_failed);
    assert_eq!((report.lines, report.events, report.notifications), (2, 2, 1));
    assert_eq!(rx.try_recv().unwrap().message, "Damage spike!");
    assert_eq!(pipeline.tailer().position().unwrap().offset, 200);

    // Nothing new, nothing read.
    let report = pipeline.run_cycle_at(NOON + 602_000).await;
    assert_eq!(report.lines, 0);
    assert!(rx.try_recv().is_err());
}

#[test]
fn simultaneous_notifications_come_out_by_priority() {
    let mut engine = engine(vec![
        RuleConfig::new("hit_log", &[EventKind::IncomingDamage], Trigger::Always, "{amount} from {source}")
            .with_priority(2),
        damage_spike(),
        RuleConfig::new("any_hit", &[EventKind::IncomingDamage], Trigger::Always, "Hit")
            .with_priority(2),
    ]);

    let out = feed(&mut engine, &hit(NOON));
    let ids: Vec<&str> = out.iter().map(|r| r.rule_id.as_str()).collect();
    assert_eq!(ids, vec!["damage_spike", "hit_log", "any_hit"]);
    assert_eq!(out[1].message, "150 from Enemy");
}
