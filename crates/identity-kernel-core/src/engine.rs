use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};

use crate::kernel::{IdentityKernel, InvariantRule, PatternKind, PatternRule, PredicateRule};

/// Error kind reported when a predicate panics instead of returning.
pub const PANIC_ERROR_KIND: &str = "panic";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    PredicateFailed,
    RestrictedPattern,
    RequiredPatternMissing,
    CheckCrashed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Violation {
    pub rule_index: usize,
    pub rule_id: String,
    pub kind: ViolationKind,
    pub message: String,
}

impl Display for Violation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(|violation| violation.message.clone()).collect()
    }

    /// The `(valid, violation messages)` pair consumers parse.
    #[must_use]
    pub fn into_parts(self) -> (bool, Vec<String>) {
        let messages = self.violations.into_iter().map(|violation| violation.message).collect();
        (self.valid, messages)
    }
}

/// Result of evaluating one rule against one text.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RuleOutcome {
    Passed,
    Violated,
    Failed(String),
}

fn evaluate_predicate(rule: &PredicateRule, text: &str) -> RuleOutcome {
    match catch_unwind(AssertUnwindSafe(|| rule.check(text))) {
        Ok(Ok(true)) => RuleOutcome::Passed,
        Ok(Ok(false)) => RuleOutcome::Violated,
        Ok(Err(err)) => RuleOutcome::Failed(err.kind().to_string()),
        Err(_) => RuleOutcome::Failed(PANIC_ERROR_KIND.to_string()),
    }
}

fn evaluate_pattern(rule: &PatternRule, folded_text: &str) -> RuleOutcome {
    let found = rule.occurs_in(folded_text);
    let violated = match rule.kind() {
        PatternKind::Contains => !found,
        PatternKind::ContainsNot => found,
    };
    if violated {
        RuleOutcome::Violated
    } else {
        RuleOutcome::Passed
    }
}

/// Evaluate a single rule. `folded_text` is `text` lowercased; pattern rules
/// match against it, predicates see the original text.
#[must_use]
pub fn evaluate_rule(rule: &InvariantRule, text: &str, folded_text: &str) -> RuleOutcome {
    match rule {
        InvariantRule::Predicate(predicate) => evaluate_predicate(predicate, text),
        InvariantRule::Pattern(pattern) => evaluate_pattern(pattern, folded_text),
    }
}

fn crashed(index: usize, error_kind: &str) -> Violation {
    let rule_id = format!("err_{index}");
    Violation {
        message: format!("[Rule:{rule_id}] Invariant Error: Check crashed ({error_kind})."),
        rule_index: index,
        rule_id,
        kind: ViolationKind::CheckCrashed,
    }
}

fn violated(index: usize, rule: &InvariantRule) -> Violation {
    let (rule_id, kind, description) = match rule {
        InvariantRule::Predicate(predicate) => (
            predicate.name().map_or_else(|| format!("lambda_{index}"), ToString::to_string),
            ViolationKind::PredicateFailed,
            "Predicate check failed".to_string(),
        ),
        InvariantRule::Pattern(pattern) => match pattern.kind() {
            PatternKind::ContainsNot => (
                pattern.id().to_string(),
                ViolationKind::RestrictedPattern,
                format!("Restricted pattern '{}' detected", pattern.pattern()),
            ),
            PatternKind::Contains => (
                pattern.id().to_string(),
                ViolationKind::RequiredPatternMissing,
                format!("Required pattern '{}' missing", pattern.pattern()),
            ),
        },
    };

    Violation {
        message: format!("[Rule:{rule_id}] Invariant Violation: {description}."),
        rule_index: index,
        rule_id,
        kind,
    }
}

/// Check `text` against every invariant of `kernel`, in rule order.
///
/// All rules are evaluated; a predicate that errors or panics is reported as a
/// `err_<index>` violation and never stops the remaining rules from running.
#[must_use]
pub fn validate(text: &str, kernel: &IdentityKernel) -> ValidationReport {
    let folded_text = text.to_lowercase();
    let mut violations = Vec::new();

    for (index, rule) in kernel.invariants.iter().enumerate() {
        match evaluate_rule(rule, text, &folded_text) {
            RuleOutcome::Passed => {}
            RuleOutcome::Violated => violations.push(violated(index, rule)),
            RuleOutcome::Failed(error_kind) => {
                tracing::error!(
                    kernel = %kernel.name,
                    rule_index = index,
                    error_kind = %error_kind,
                    "invariant check crashed"
                );
                violations.push(crashed(index, &error_kind));
            }
        }
    }

    if !violations.is_empty() {
        tracing::warn!(
            kernel = %kernel.name,
            violations = ?violations.iter().map(|v| v.message.as_str()).collect::<Vec<_>>(),
            "identity invariant validation failure"
        );
    }

    ValidationReport { valid: violations.is_empty(), violations }
}
