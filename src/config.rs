/// Application configuration, persisted as TOML in the app directory.
///
/// The app directory is, in order of preference:
///   $EVE_COPILOT_HOME
///   %APPDATA%\eve-copilot   (e.g. C:\Users\<user>\AppData\Roaming\eve-copilot)
///   <temp dir>/eve-copilot
///
/// NOTE: log_path may name either a single game log or the `Gamelogs`
/// **directory**; for a directory the newest `*.txt` in it is tailed, and the
/// tailer switches automatically when EVE starts a new timestamped session log.
///
/// Rule profiles live in the same file under `[profiles.<name>]`. A missing
/// file yields the built-in `abyssal` and `general` profiles.
use crate::{
    engine::EngineSettings,
    error::ConfigError,
    event::EventKind,
    pipeline::PipelineSettings,
    rules::{RuleConfig, RuleSet, Trigger},
    tailer::TailerState,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Replay the whole file on startup (stale events are still filtered).
    #[default]
    Beginning,
    /// Skip whatever is already in the file when the copilot starts.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationOutput {
    /// Notifications go to the application log only.
    #[default]
    Log,
    /// One JSON object per line on stdout, for an external speech process.
    JsonStdout,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Game log file, or the Gamelogs directory to pick the newest file from.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on one log read before it counts as a transient failure.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default)]
    pub start_position: StartPosition,

    /// Events older than this are not evaluated. 0 disables the check.
    #[serde(default = "default_max_event_age_secs")]
    pub max_event_age_secs: u64,

    #[serde(default = "default_threat_board_capacity")]
    pub threat_board_capacity: usize,

    /// Use OS file notifications to poll early. The timer still runs.
    #[serde(default = "default_true")]
    pub watch_fs_events: bool,

    #[serde(default)]
    pub notification_output: NotificationOutput,

    #[serde(default = "default_active_profile")]
    pub active_profile: String,

    #[serde(default = "default_profiles")]
    pub profiles: BTreeMap<String, Profile>,
}

fn default_true() -> bool { true }
fn default_poll_interval_ms() -> u64 { 250 }
fn default_read_timeout_ms() -> u64 { 2_000 }
fn default_max_event_age_secs() -> u64 { 1_800 }
fn default_threat_board_capacity() -> usize { 8 }
fn default_active_profile() -> String { "abyssal".to_owned() }

fn default_log_path() -> PathBuf {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
        .unwrap_or_default()
        .join("Documents")
        .join("EVE")
        .join("logs")
        .join("Gamelogs")
}

fn default_profiles() -> BTreeMap<String, Profile> {
    BTreeMap::from([
        ("abyssal".to_owned(), Profile { rules: abyssal_rules() }),
        ("general".to_owned(), Profile { rules: general_rules() }),
    ])
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_path:              default_log_path(),
            poll_interval_ms:      default_poll_interval_ms(),
            read_timeout_ms:       default_read_timeout_ms(),
            start_position:        StartPosition::default(),
            max_event_age_secs:    default_max_event_age_secs(),
            threat_board_capacity: default_threat_board_capacity(),
            watch_fs_events:       true,
            notification_output:   NotificationOutput::default(),
            active_profile:        default_active_profile(),
            profiles:              default_profiles(),
        }
    }
}

impl AppConfig {
    /// Validate and compile the named profile.
    pub fn rule_set(&self, profile: &str) -> Result<RuleSet, ConfigError> {
        let found = self
            .profiles
            .get(profile)
            .ok_or_else(|| ConfigError::UnknownProfile(profile.to_owned()))?;
        RuleSet::compile(found.rules.clone())
    }

    pub fn active_rule_set(&self) -> Result<RuleSet, ConfigError> {
        self.rule_set(&self.active_profile)
    }

    pub fn profile_names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            poll_interval:    Duration::from_millis(self.poll_interval_ms.max(1)),
            read_timeout:     Duration::from_millis(self.read_timeout_ms.max(1)),
            max_event_age_ms: (self.max_event_age_secs > 0)
                .then(|| self.max_event_age_secs.saturating_mul(1_000)),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings { threat_board_capacity: self.threat_board_capacity }
    }

    /// True when `log_path` names the Gamelogs directory rather than one
    /// file. A path that does not exist yet counts as a directory unless it
    /// ends in `.txt`.
    pub fn follows_directory(&self) -> bool {
        if self.log_path.exists() {
            return self.log_path.is_dir();
        }
        !self
            .log_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"))
    }

    /// Tailer for `log_path`, following the newest session log when it is a
    /// directory.
    pub fn tailer(&self) -> TailerState {
        let start_at_end = self.start_position == StartPosition::End;
        if self.follows_directory() {
            TailerState::follow_directory(&self.log_path, start_at_end)
        } else {
            TailerState::new(&self.log_path, start_at_end)
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in profiles
// ---------------------------------------------------------------------------

fn abyssal_rules() -> Vec<RuleConfig> {
    use EventKind as K;
    vec![
        RuleConfig::new("damage_spike", &[K::IncomingDamage], Trigger::HitCount { min_hits: 1, max_hits: Some(1) }, "Damage spike!")
            .with_cooldown(30_000)
            .with_priority(9),
        RuleConfig::new("sustained_damage", &[K::IncomingDamage], Trigger::WindowedSum { min_total: 1_500, window_ms: 10_000 }, "Heavy damage, {total} in ten seconds")
            .with_cooldown(15_000)
            .with_priority(7),
        RuleConfig::new("shield_low", &[K::ShieldLevel], Trigger::Below { threshold: 50.0 }, "Shield low, {percent} percent")
            .with_cooldown(10_000)
            .with_priority(10),
        RuleConfig::new("capacitor_low", &[K::CapacitorLevel], Trigger::Below { threshold: 25.0 }, "Capacitor low, {percent} percent")
            .with_cooldown(10_000)
            .with_priority(8),
        RuleConfig::new("warp_scrambled", &[K::WarpScrambled], Trigger::Always, "Warp scrambled!")
            .with_cooldown(10_000)
            .with_priority(10),
        RuleConfig::new("webbed", &[K::Webbed], Trigger::Always, "Webbed")
            .with_cooldown(10_000)
            .with_priority(6),
        RuleConfig::new("neutralized", &[K::CapacitorNeutralized], Trigger::Always, "Capacitor being neutralized")
            .with_cooldown(10_000)
            .with_priority(7),
        RuleConfig::new("drone_damage", &[K::DroneDamage], Trigger::WindowedSum { min_total: 500, window_ms: 10_000 }, "Drones taking damage")
            .with_cooldown(20_000)
            .with_priority(5),
        RuleConfig::new("target_call", &[K::EnemyAppeared], Trigger::TargetRecommendation, "Recommended target: {target}")
            .with_cooldown(20_000)
            .with_priority(6),
        RuleConfig::new("room_cleared", &[K::RoomCleared], Trigger::Always, "Room cleared")
            .with_priority(3),
        RuleConfig::new("wave_complete", &[K::WaveComplete], Trigger::Always, "Wave complete")
            .with_priority(3),
        RuleConfig::new("cargo", &[K::CargoApproach], Trigger::Always, "Approaching the cache")
            .with_priority(2),
        RuleConfig::new("time_check", &[K::ElapsedTimeMarker], Trigger::AtLeast { threshold: 15.0 }, "{minutes} minutes elapsed, pick up the pace")
            .with_cooldown(60_000)
            .with_priority(8),
        RuleConfig::new("module_off", &[K::ModuleDeactivated], Trigger::Always, "{name} offline")
            .with_priority(4),
    ]
}

fn general_rules() -> Vec<RuleConfig> {
    use EventKind as K;
    vec![
        RuleConfig::new("shield_low", &[K::ShieldLevel], Trigger::Below { threshold: 30.0 }, "Shield at {percent} percent")
            .with_cooldown(15_000)
            .with_priority(10),
        RuleConfig::new("capacitor_low", &[K::CapacitorLevel], Trigger::Below { threshold: 20.0 }, "Capacitor at {percent} percent")
            .with_cooldown(15_000)
            .with_priority(8),
        RuleConfig::new("warp_scrambled", &[K::WarpScrambled], Trigger::Always, "Warp scrambled!")
            .with_cooldown(10_000)
            .with_priority(10),
        RuleConfig::new("heavy_damage", &[K::IncomingDamage], Trigger::WindowedSum { min_total: 2_000, window_ms: 10_000 }, "Taking heavy damage")
            .with_cooldown(20_000)
            .with_priority(7),
    ]
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "config.toml";

pub fn app_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("EVE_COPILOT_HOME") {
        return PathBuf::from(home);
    }
    std::env::var_os("APPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("eve-copilot")
}

pub fn load_or_default(config_dir: &Path) -> Result<AppConfig> {
    let path = config_dir.join(CONFIG_FILE);
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let cfg: AppConfig =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })?;
        Ok(cfg)
    } else {
        tracing::info!("No {} in {:?}, using defaults", CONFIG_FILE, config_dir);
        Ok(AppConfig::default())
    }
}

pub fn save(config: &AppConfig, config_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(config_dir)?;
    let raw = toml::to_string_pretty(config)
        .map_err(|e| anyhow::anyhow!("Config serialize error: {}", e))?;
    std::fs::write(config_dir.join(CONFIG_FILE), raw)?;
    Ok(())
}
