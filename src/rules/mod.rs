/// Rule definitions and the compiled rule set the engine evaluates.
///
/// Rules are data, not code: each one names the event kinds it listens to,
/// a [`Trigger`] predicate, a cooldown, a priority and a message template.
/// A [`RuleSet`] is only ever built through [`RuleSet::compile`], so the
/// engine never sees a rule that failed validation.
pub mod template;
pub mod validation;

use crate::error::{ConfigError, RuleError};
use crate::event::EventKind;
use serde::{Deserialize, Serialize};
use template::MessageTemplate;

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires on every matching event.
    #[default]
    Always,
    /// Event magnitude strictly below `threshold`.
    Below { threshold: f64 },
    /// Event magnitude at or above `threshold`.
    AtLeast { threshold: f64 },
    /// Matching events seen since the last room reset, within
    /// `min_hits..=max_hits`.
    HitCount {
        min_hits: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_hits: Option<u32>,
    },
    /// Sum of event amounts over the trailing `window_ms` reaches `min_total`.
    WindowedSum { min_total: u64, window_ms: u64 },
    /// Announce the top entry of the threat board.
    TargetRecommendation,
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Always               => "always",
            Self::Below { .. }         => "below",
            Self::AtLeast { .. }       => "at_least",
            Self::HitCount { .. }      => "hit_count",
            Self::WindowedSum { .. }   => "windowed_sum",
            Self::TargetRecommendation => "target_recommendation",
        }
    }

    /// Template fields the trigger itself provides, on top of event fields.
    pub fn derived_fields(&self) -> &'static [&'static str] {
        match self {
            Self::HitCount { .. }      => &["count"],
            Self::WindowedSum { .. }   => &["total"],
            Self::TargetRecommendation => &["target", "target_threat"],
            _ => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Rule configuration (as written in config.toml)
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_cooldown_ms() -> u64 { 5_000 }
fn default_priority() -> i32 { 1 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id:                   String,
    #[serde(default = "default_true")]
    pub enabled:              bool,
    pub events:               Vec<EventKind>,
    #[serde(default)]
    pub trigger:              Trigger,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms:          u64,
    /// Higher is more urgent.
    #[serde(default = "default_priority")]
    pub priority:             i32,
    pub message:              String,
    /// Counters reset when a room is cleared.
    #[serde(default = "default_true")]
    pub room_scoped:          bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unless_module_active: Option<String>,
}

impl RuleConfig {
    /// A rule with every optional key at its default.
    pub fn new(id: &str, events: &[EventKind], trigger: Trigger, message: &str) -> Self {
        Self {
            id:                   id.to_owned(),
            enabled:              true,
            events:               events.to_vec(),
            trigger,
            cooldown_ms:          default_cooldown_ms(),
            priority:             default_priority(),
            message:              message.to_owned(),
            room_scoped:          true,
            unless_module_active: None,
        }
    }

    pub fn with_cooldown(mut self, cooldown_ms: u64) -> Self {
        self.cooldown_ms = cooldown_ms;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn unless_active(mut self, module: &str) -> Self {
        self.unless_module_active = Some(module.to_owned());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Compiled rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Rule {
    pub config:   RuleConfig,
    pub template: MessageTemplate,
}

impl Rule {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn listens_to(&self, kind: EventKind) -> bool {
        self.config.events.contains(&kind)
    }
}

/// Validated, immutable rule snapshot in configuration order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Validate every definition and compile the templates. All problems are
    /// reported together.
    pub fn compile(configs: Vec<RuleConfig>) -> Result<Self, ConfigError> {
        let errors = validation::validate_rules(&configs);
        if !errors.is_empty() {
            return Err(ConfigError::InvalidRules(errors));
        }

        let mut rules = Vec::with_capacity(configs.len());
        let mut template_errors = Vec::new();
        for config in configs {
            match MessageTemplate::parse(&config.message) {
                Ok(template) => rules.push(Rule { config, template }),
                Err(reason) => template_errors.push(RuleError::MalformedTemplate {
                    id: config.id.clone(),
                    reason,
                }),
            }
        }
        if !template_errors.is_empty() {
            return Err(ConfigError::InvalidRules(template_errors));
        }

        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id() == id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.rules.iter().filter(|r| r.config.enabled).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        rules: Vec<RuleConfig>,
    }

    #[test]
    fn rule_toml_uses_defaults() {
        let parsed: Wrapper = toml::from_str(
            r#"
            [[rules]]
            id      = "shield_low"
            events  = ["shield_level"]
            trigger = { kind = "below", threshold = 50 }
            message = "Shield low, {percent} percent"
            "#,
        )
        .unwrap();

        let rule = &parsed.rules[0];
        assert!(rule.enabled);
        assert!(rule.room_scoped);
        assert_eq!(rule.cooldown_ms, 5_000);
        assert_eq!(rule.priority, 1);
        assert_eq!(rule.trigger, Trigger::Below { threshold: 50.0 });
        assert_eq!(rule.unless_module_active, None);
    }

    #[test]
    fn trigger_defaults_to_always() {
        let parsed: Wrapper = toml::from_str(
            r#"
            [[rules]]
            id      = "webbed"
            events  = ["webbed"]
            message = "Webbed"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.rules[0].trigger, Trigger::Always);
    }

    #[test]
    fn hit_count_max_is_optional() {
        let t: Trigger = toml::from_str(r#"kind = "hit_count"
min_hits = 3"#).unwrap();
        assert_eq!(t, Trigger::HitCount { min_hits: 3, max_hits: None });
    }

    #[test]
    fn compile_keeps_configuration_order() {
        let set = RuleSet::compile(vec![
            RuleConfig::new("b", &[EventKind::Webbed], Trigger::Always, "Webbed"),
            RuleConfig::new("a", &[EventKind::WarpScrambled], Trigger::Always, "Scrammed"),
        ])
        .unwrap();

        let ids: Vec<&str> = set.rules().iter().map(Rule::id).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(set.get("a").unwrap().listens_to(EventKind::WarpScrambled));
        assert!(!set.get("a").unwrap().listens_to(EventKind::Webbed));
    }

    #[test]
    fn compile_rejects_invalid_rules() {
        let err = RuleSet::compile(vec![
            RuleConfig::new("dup", &[EventKind::Webbed], Trigger::Always, "one"),
            RuleConfig::new("dup", &[EventKind::Webbed], Trigger::Always, "two"),
        ])
        .unwrap_err();

        match err {
            ConfigError::InvalidRules(errors) => {
                assert_eq!(errors, vec![RuleError::DuplicateId("dup".into())]);
            }
            other => panic!("Wrong error: {:?}", other),
        }
    }
}
