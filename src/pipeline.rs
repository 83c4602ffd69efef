/// Drives the tailer → parser → engine → sink flow.
///
/// Work happens in *cycles*: one bounded poll of the log, then every new
/// line is parsed and every event evaluated, in file order, with each
/// notification pushed to the sink queue as soon as it is produced. A cycle
/// always runs to completion; the scheduling loop in [`Pipeline::run`] only
/// looks at cancellation and commands between cycles.
use crate::{
    engine::{Engine, EngineSnapshot, NotificationRequest},
    parser,
    rules::RuleSet,
    tailer::{RawLine, TailerState},
};
use anyhow::Result;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum PipelineCommand {
    /// Replace the rule set and reset all engine state.
    SwitchProfile { name: String, rules: RuleSet },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub poll_interval:    Duration,
    pub read_timeout:     Duration,
    /// Events older than this (by wall clock) are dropped. `None` disables.
    pub max_event_age_ms: Option<u64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval:    Duration::from_millis(250),
            read_timeout:     Duration::from_millis(2_000),
            max_event_age_ms: Some(1_800_000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub lines:         usize,
    pub events:        usize,
    pub stale:         usize,
    pub notifications: usize,
    /// The poll failed; nothing was read and the position was kept.
    pub poll_failed:   bool,
    pub sink_closed:   bool,
}

pub fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct Pipeline {
    tailer:   TailerState,
    engine:   Engine,
    tx:       Sender<NotificationRequest>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        tailer:   TailerState,
        engine:   Engine,
        tx:       Sender<NotificationRequest>,
        settings: PipelineSettings,
    ) -> Self {
        Self { tailer, engine, tx, settings }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn tailer(&self) -> &TailerState {
        &self.tailer
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.run_cycle_at(wall_clock_ms()).await
    }

    /// One cycle with an explicit wall clock (stamped on lines without a
    /// timestamp and used by the stale-event guard).
    pub async fn run_cycle_at(&mut self, wall_ms: u64) -> CycleReport {
        match self.tailer.poll_bounded(self.settings.read_timeout, wall_ms).await {
            Ok(lines) => self.process_lines(lines, wall_ms).await,
            Err(e) => {
                tracing::warn!("Log poll failed, retrying next cycle: {}", e);
                CycleReport { poll_failed: true, ..Default::default() }
            }
        }
    }

    async fn process_lines(&mut self, lines: Vec<RawLine>, wall_ms: u64) -> CycleReport {
        let mut report = CycleReport { lines: lines.len(), ..Default::default() };

        for line in &lines {
            let Some(event) = parser::parse_line(line) else {
                continue;
            };
            report.events += 1;

            if let Some(max_age) = self.settings.max_event_age_ms {
                if wall_ms.saturating_sub(event.timestamp_ms) > max_age {
                    report.stale += 1;
                    continue;
                }
            }

            // Rule timing follows the log's own clock.
            let now_ms = event.timestamp_ms;
            for request in self.engine.evaluate(&event, now_ms) {
                if self.tx.send(request).await.is_err() {
                    report.sink_closed = true;
                    return report;
                }
                report.notifications += 1;
            }
        }

        if report.stale > 0 {
            tracing::debug!("Dropped {} stale event(s)", report.stale);
        }
        report
    }

    fn apply_command(&mut self, command: PipelineCommand) {
        match command {
            PipelineCommand::SwitchProfile { name, rules } => {
                tracing::info!("Switching to profile '{}' ({} rules)", name, rules.len());
                self.engine.reset(rules);
            }
        }
    }

    /// Run cycles on the poll interval (and on every wake hint) until
    /// `cancel` fires or the sink goes away. Returns the final engine
    /// snapshot.
    pub async fn run(
        mut self,
        mut commands: Receiver<PipelineCommand>,
        mut wake:     Option<Receiver<()>>,
        cancel:       CancellationToken,
    ) -> Result<EngineSnapshot> {
        tracing::info!(
            "Pipeline starting: {:?}, polling every {:?}",
            self.tailer.directory().unwrap_or(self.tailer.path()),
            self.settings.poll_interval
        );

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let report = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!("Pipeline cancelled, stopping");
                    break;
                }

                Some(command) = commands.recv() => {
                    self.apply_command(command);
                    continue;
                }

                _ = ticker.tick() => self.run_cycle().await,

                Some(()) = next_wake(&mut wake) => self.run_cycle().await,
            };

            if report.sink_closed {
                tracing::warn!("Notification sink closed, stopping pipeline");
                break;
            }
        }

        let snapshot = self.engine.snapshot();
        tracing::info!(
            "Pipeline stopped after {} event(s), {} notification(s)",
            snapshot.events_evaluated,
            snapshot.notifications_emitted
        );
        Ok(snapshot)
    }
}

async fn next_wake(wake: &mut Option<Receiver<()>>) -> Option<()> {
    match wake {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::event::EventKind;
    use crate::rules::{RuleConfig, Trigger};
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    fn rules() -> RuleSet {
        RuleSet::compile(vec![
            RuleConfig::new(
                "damage_spike",
                &[EventKind::IncomingDamage],
                Trigger::HitCount { min_hits: 1, max_hits: Some(1) },
                "Damage spike!",
            )
            .with_cooldown(30_000)
            .with_priority(9),
            RuleConfig::new("webbed", &[EventKind::Webbed], Trigger::Always, "Webbed"),
        ])
        .unwrap()
    }

    fn pipeline(
        path:    &std::path::Path,
        max_age: Option<u64>,
    ) -> (Pipeline, mpsc::Receiver<NotificationRequest>) {
        let (tx, rx) = mpsc::channel(64);
        let settings = PipelineSettings {
            poll_interval:    Duration::from_millis(20),
            read_timeout:     Duration::from_secs(5),
            max_event_age_ms: max_age,
        };
        let engine = Engine::new(rules(), EngineSettings::default());
        (Pipeline::new(TailerState::new(path, false), engine, tx, settings), rx)
    }

    #[tokio::test]
    async fn cycle_processes_lines_in_order() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "2024.01.01 12:00:00 You are being hit by Enemy for 150 damage").unwrap();
        writeln!(f, "some chatter the parser ignores").unwrap();
        writeln!(f, "2024.01.01 12:00:01 You are webbed by Vedmak").unwrap();
        f.flush().unwrap();

        let (mut p, mut rx) = pipeline(f.path(), None);
        let report = p.run_cycle().await;

        assert_eq!(report.lines, 3);
        assert_eq!(report.events, 2);
        assert_eq!(report.notifications, 2);
        assert_eq!(rx.try_recv().unwrap().message, "Damage spike!");
        assert_eq!(rx.try_recv().unwrap().message, "Webbed");

        // Nothing new: an empty cycle.
        assert_eq!(p.run_cycle().await, CycleReport::default());
    }

    #[tokio::test]
    async fn stale_events_are_dropped() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "2024.01.01 12:00:00 You are webbed by Vedmak").unwrap();
        writeln!(f, "2024.01.01 12:59:00 You are webbed by Vedmak").unwrap();
        f.flush().unwrap();

        let (mut p, mut rx) = pipeline(f.path(), Some(1_800_000));
        let wall = crate::parser::parse_timestamp("2024.01.01 13:00:00").unwrap();
        let report = p.run_cycle_at(wall).await;

        assert_eq!(report.stale, 1);
        assert_eq!(report.notifications, 1);
        assert_eq!(rx.try_recv().unwrap().timestamp_ms, wall - 60_000);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_log_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (mut p, _rx) = pipeline(&dir.path().join("absent.txt"), None);
        let report = p.run_cycle().await;
        assert!(!report.poll_failed);
        assert_eq!(report.lines, 0);
    }

    #[tokio::test]
    async fn closed_sink_is_reported() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "You are webbed by Vedmak").unwrap();
        f.flush().unwrap();

        let (mut p, rx) = pipeline(f.path(), None);
        drop(rx);
        assert!(p.run_cycle().await.sink_closed);
    }

    #[tokio::test]
    async fn failed_poll_keeps_position_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20250128_143000_9000001.txt");
        let aside = dir.path().join("parked");
        std::fs::write(&path, "2024.01.01 12:00:00 You are webbed by Vedmak\n").unwrap();

        let (mut p, mut rx) = pipeline(&path, None);
        assert_eq!(p.run_cycle().await.lines, 1);
        assert_eq!(rx.try_recv().unwrap().message, "Webbed");
        let before = p.tailer().position();

        // The log is temporarily unreadable; the same file comes back later.
        std::fs::rename(&path, &aside).unwrap();
        std::fs::create_dir(&path).unwrap();
        for _ in 0..2 {
            let report = p.run_cycle().await;
            assert!(report.poll_failed);
            assert_eq!(report.lines, 0);
            assert_eq!(p.tailer().position(), before);
        }

        std::fs::remove_dir(&path).unwrap();
        std::fs::rename(&aside, &path).unwrap();
        let mut f = std::fs::File::options().append(true).open(&path).unwrap();
        writeln!(f, "2024.01.01 12:00:09 You are being hit by Enemy for 150 damage").unwrap();
        f.flush().unwrap();

        let report = p.run_cycle().await;
        assert!(!report.poll_failed);
        assert_eq!(report.lines, 1);
        assert_eq!(rx.try_recv().unwrap().message, "Damage spike!");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn follows_a_new_session_log_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let engine = Engine::new(rules(), EngineSettings::default());
        let mut p = Pipeline::new(
            TailerState::follow_directory(dir.path(), false),
            engine,
            tx,
            PipelineSettings { max_event_age_ms: None, ..PipelineSettings::default() },
        );

        // No session yet.
        assert_eq!(p.run_cycle().await, CycleReport::default());

        let first = dir.path().join("20250128_143000_9000001.txt");
        std::fs::write(&first, "2024.01.01 12:00:00 You are webbed by Vedmak\n").unwrap();
        assert_eq!(p.run_cycle().await.notifications, 1);
        assert_eq!(rx.try_recv().unwrap().message, "Webbed");

        // The game starts a new session log next to the old one.
        std::fs::File::options()
            .write(true)
            .open(&first)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(600))
            .unwrap();
        let second = dir.path().join("20250128_160000_9000001.txt");
        std::fs::write(&second, "2024.01.01 13:00:00 You are being hit by Enemy for 90 damage\n").unwrap();

        let report = p.run_cycle().await;
        assert_eq!((report.lines, report.notifications), (1, 1));
        assert_eq!(rx.try_recv().unwrap().message, "Damage spike!");
        assert_eq!(p.tailer().path(), second.as_path());
    }

    #[tokio::test]
    async fn run_loop_applies_queued_commands_before_polling() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "You are webbed by Vedmak").unwrap();
        writeln!(f, "You are being warp scrambled by Damavik").unwrap();
        f.flush().unwrap();

        let (p, mut rx) = pipeline(f.path(), None);
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        // Queued before the loop starts, so it lands before the first cycle.
        let quiet = RuleSet::compile(vec![RuleConfig::new(
            "scram",
            &[EventKind::WarpScrambled],
            Trigger::Always,
            "Scrambled",
        )])
        .unwrap();
        cmd_tx
            .send(PipelineCommand::SwitchProfile { name: "quiet".into(), rules: quiet })
            .await
            .unwrap();

        let handle = tokio::spawn(p.run(cmd_rx, None, cancel.clone()));

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.rule_id, "scram");

        cancel.cancel();
        let snapshot = handle.await.unwrap().unwrap();
        assert_eq!(snapshot.rules, 1);
        assert_eq!(snapshot.notifications_emitted, 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn wake_hint_triggers_a_cycle() {
        let mut f = NamedTempFile::new().unwrap();
        let (mut p, mut rx) = pipeline(f.path(), None);
        p.settings.poll_interval = Duration::from_secs(3_600);

        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(p.run(cmd_rx, Some(wake_rx), cancel.clone()));

        // Let the immediate first tick pass.
        tokio::time::sleep(Duration::from_millis(50)).await;
        writeln!(f, "You are webbed by Vedmak").unwrap();
        f.flush().unwrap();
        wake_tx.send(()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message, "Webbed");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
