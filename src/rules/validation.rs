/// Rule set validation
use super::template::MessageTemplate;
use super::{RuleConfig, Trigger};
use crate::error::RuleError;
use crate::event::EventKind;
use std::collections::HashSet;

/// Longest cooldown a rule may declare (one hour).
pub const MAX_COOLDOWN_MS: u64 = 3_600_000;

/// Validate a whole rule list. An empty result means the list is usable.
pub fn validate_rules(rules: &[RuleConfig]) -> Vec<RuleError> {
    let mut errors = Vec::new();

    let mut seen_ids = HashSet::new();
    for (index, rule) in rules.iter().enumerate() {
        if rule.id.trim().is_empty() {
            errors.push(RuleError::EmptyId { index });
        } else if !seen_ids.insert(rule.id.as_str()) {
            errors.push(RuleError::DuplicateId(rule.id.clone()));
        }
    }

    for rule in rules {
        errors.extend(validate_rule(rule));
    }

    errors
}

fn validate_rule(rule: &RuleConfig) -> Vec<RuleError> {
    let mut errors = Vec::new();
    let id = rule.id.clone();

    if rule.events.is_empty() {
        errors.push(RuleError::NoEvents(id.clone()));
    }
    if rule.message.trim().is_empty() {
        errors.push(RuleError::EmptyMessage(id.clone()));
    }
    if rule.cooldown_ms > MAX_COOLDOWN_MS {
        errors.push(RuleError::CooldownTooLong {
            id:          id.clone(),
            cooldown_ms: rule.cooldown_ms,
            max_ms:      MAX_COOLDOWN_MS,
        });
    }
    if let Some(module) = &rule.unless_module_active {
        if module.trim().is_empty() {
            errors.push(RuleError::EmptyModuleGate(id.clone()));
        }
    }

    errors.extend(validate_trigger(rule));

    match MessageTemplate::parse(&rule.message) {
        Ok(template) => errors.extend(validate_placeholders(rule, &template)),
        Err(reason) => errors.push(RuleError::MalformedTemplate { id, reason }),
    }

    errors
}

fn validate_trigger(rule: &RuleConfig) -> Vec<RuleError> {
    let mut errors = Vec::new();
    let mismatch = |kind: EventKind| RuleError::TriggerKindMismatch {
        id:      rule.id.clone(),
        trigger: rule.trigger.name(),
        kind:    kind.to_string(),
    };

    match &rule.trigger {
        Trigger::Below { threshold } | Trigger::AtLeast { threshold } => {
            let threshold = *threshold;
            if !threshold.is_finite() {
                errors.push(RuleError::InvalidThreshold {
                    id:     rule.id.clone(),
                    value:  threshold,
                    reason: "not a finite number",
                });
                return errors;
            }

            for kind in &rule.events {
                if !kind.has_magnitude() {
                    errors.push(mismatch(*kind));
                }
            }

            let percent_kind = rule.events.iter().any(EventKind::is_percent);
            if percent_kind && !(threshold > 0.0 && threshold <= 100.0) {
                errors.push(RuleError::InvalidThreshold {
                    id:     rule.id.clone(),
                    value:  threshold,
                    reason: "percent thresholds must be in (0, 100]",
                });
            }
        }
        Trigger::HitCount { min_hits, max_hits } => {
            if *min_hits == 0 || max_hits.is_some_and(|max| max < *min_hits) {
                errors.push(RuleError::InvalidHitCount {
                    id:       rule.id.clone(),
                    min_hits: *min_hits,
                    max_hits: *max_hits,
                });
            }
        }
        Trigger::WindowedSum { min_total, window_ms } => {
            if *min_total == 0 || *window_ms == 0 {
                errors.push(RuleError::InvalidWindow { id: rule.id.clone() });
            }
            for kind in &rule.events {
                if !kind.has_amount() {
                    errors.push(mismatch(*kind));
                }
            }
        }
        Trigger::Always | Trigger::TargetRecommendation => {}
    }

    errors
}

/// Every placeholder must be derived by the trigger or be a field of every
/// kind the rule listens to.
fn validate_placeholders(rule: &RuleConfig, template: &MessageTemplate) -> Vec<RuleError> {
    let mut errors = Vec::new();
    let derived = rule.trigger.derived_fields();
    let mut checked = HashSet::new();

    for field in template.placeholders() {
        if !checked.insert(field) || derived.contains(&field) {
            continue;
        }
        if let Some(kind) = rule.events.iter().find(|k| !k.has_field(field)) {
            errors.push(RuleError::UnknownField {
                id:    rule.id.clone(),
                field: field.to_owned(),
                kind:  kind.to_string(),
            });
        }
    }

    errors
}
