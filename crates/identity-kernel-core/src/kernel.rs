use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("malformed rule at index {index}: {reason}")]
    MalformedRule { index: usize, reason: String },
}

/// Failure raised by a predicate check. The `kind` is what surfaces in the
/// `Check crashed (<kind>)` violation message.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{kind}: {message}")]
pub struct PredicateError {
    kind: String,
    message: String,
}

impl PredicateError {
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind: kind.into(), message: message.into() }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type PredicateFn = Arc<dyn Fn(&str) -> Result<bool, PredicateError> + Send + Sync>;

fn infallible<F>(check: F) -> PredicateFn
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    Arc::new(move |text: &str| -> Result<bool, PredicateError> { Ok(check(text)) })
}

#[derive(Clone)]
pub struct PredicateRule {
    name: Option<String>,
    check: PredicateFn,
}

impl PredicateRule {
    #[must_use]
    pub fn new(name: Option<String>, check: PredicateFn) -> Self {
        Self { name, check }
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Run the underlying check. Panics are not caught here.
    ///
    /// # Errors
    /// Returns the [`PredicateError`] raised by the check itself.
    pub fn check(&self, text: &str) -> Result<bool, PredicateError> {
        (self.check)(text)
    }
}

impl Debug for PredicateRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateRule").field("name", &self.name).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Contains,
    ContainsNot,
}

impl PatternKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::ContainsNot => "contains_not",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "contains" => Some(Self::Contains),
            "contains_not" => Some(Self::ContainsNot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PatternRule {
    id: String,
    kind: PatternKind,
    pattern: String,
    folded: String,
}

impl PatternRule {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: PatternKind, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let folded = pattern.to_lowercase();
        Self { id: id.into(), kind, pattern, folded }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// `folded_text` MUST already be lowercased.
    #[must_use]
    pub fn occurs_in(&self, folded_text: &str) -> bool {
        folded_text.contains(self.folded.as_str())
    }
}

/// One identity rule. The shape is fixed when the rule is built, so the
/// engine never has to guess what a rule is at validation time.
#[derive(Debug, Clone)]
pub enum InvariantRule {
    Predicate(PredicateRule),
    Pattern(PatternRule),
}

impl InvariantRule {
    pub fn predicate<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(PredicateRule::new(Some(name.into()), infallible(check)))
    }

    pub fn try_predicate<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&str) -> Result<bool, PredicateError> + Send + Sync + 'static,
    {
        Self::Predicate(PredicateRule::new(Some(name.into()), Arc::new(check)))
    }

    /// A predicate without a name; violations report it as `lambda_<index>`.
    pub fn anonymous_predicate<F>(check: F) -> Self
    where
        F: Fn(&str) -> Result<bool, PredicateError> + Send + Sync + 'static,
    {
        Self::Predicate(PredicateRule::new(None, Arc::new(check)))
    }

    #[must_use]
    pub fn contains(id: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Pattern(PatternRule::new(id, PatternKind::Contains, pattern))
    }

    #[must_use]
    pub fn contains_not(id: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Pattern(PatternRule::new(id, PatternKind::ContainsNot, pattern))
    }
}

#[derive(Debug, Clone)]
pub struct IdentityKernel {
    pub name: String,
    pub role: String,
    pub core_values: Vec<String>,
    pub communication_style: String,
    pub expertise_domains: Vec<String>,
    pub invariants: Vec<InvariantRule>,
}

impl IdentityKernel {
    /// Build a kernel from its document form, resolving predicate names through `registry`.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when identity fields are empty, or
    /// [`KernelError::MalformedRule`] when a rule has an empty pattern or names an
    /// unregistered predicate.
    pub fn from_spec(spec: &KernelSpec, registry: &PredicateRegistry) -> Result<Self, KernelError> {
        if spec.name.trim().is_empty() {
            return Err(KernelError::Validation("kernel name MUST be provided".to_string()));
        }
        if spec.role.trim().is_empty() {
            return Err(KernelError::Validation("kernel role MUST be provided".to_string()));
        }

        let mut invariants = Vec::with_capacity(spec.invariants.len());
        for (index, rule) in spec.invariants.iter().enumerate() {
            invariants.push(build_rule(index, rule, registry)?);
        }

        Ok(Self {
            name: spec.name.clone(),
            role: spec.role.clone(),
            core_values: spec.core_values.clone(),
            communication_style: spec.communication_style.clone(),
            expertise_domains: spec.expertise_domains.clone(),
            invariants,
        })
    }

    /// Convert back into the document form.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for unnamed predicates, which have no
    /// document representation.
    pub fn to_spec(&self) -> Result<KernelSpec, KernelError> {
        let mut invariants = Vec::with_capacity(self.invariants.len());
        for (index, rule) in self.invariants.iter().enumerate() {
            let spec = match rule {
                InvariantRule::Predicate(predicate) => {
                    let Some(name) = predicate.name() else {
                        return Err(KernelError::Validation(format!(
                            "predicate at index {index} is unnamed and cannot be persisted"
                        )));
                    };
                    RuleSpec::Predicate { name: name.to_string() }
                }
                InvariantRule::Pattern(pattern) => match pattern.kind() {
                    PatternKind::Contains => RuleSpec::Contains {
                        id: Some(pattern.id().to_string()),
                        pattern: pattern.pattern().to_string(),
                    },
                    PatternKind::ContainsNot => RuleSpec::ContainsNot {
                        id: Some(pattern.id().to_string()),
                        pattern: pattern.pattern().to_string(),
                    },
                },
            };
            invariants.push(spec);
        }

        Ok(KernelSpec {
            name: self.name.clone(),
            role: self.role.clone(),
            core_values: self.core_values.clone(),
            communication_style: self.communication_style.clone(),
            expertise_domains: self.expertise_domains.clone(),
            invariants,
        })
    }
}

fn build_rule(
    index: usize,
    rule: &RuleSpec,
    registry: &PredicateRegistry,
) -> Result<InvariantRule, KernelError> {
    let (kind, id, pattern) = match rule {
        RuleSpec::Predicate { name } => {
            return registry.resolve(name).ok_or_else(|| KernelError::MalformedRule {
                index,
                reason: format!("predicate `{name}` is not registered"),
            });
        }
        RuleSpec::Contains { id, pattern } => (PatternKind::Contains, id, pattern),
        RuleSpec::ContainsNot { id, pattern } => (PatternKind::ContainsNot, id, pattern),
    };

    if pattern.trim().is_empty() {
        return Err(KernelError::MalformedRule {
            index,
            reason: "pattern MUST be non-empty".to_string(),
        });
    }

    let id = match id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("entry_{index}"),
    };
    Ok(InvariantRule::Pattern(PatternRule::new(id, kind, pattern.clone())))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleSpec {
    Contains {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        pattern: String,
    },
    ContainsNot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        pattern: String,
    },
    Predicate {
        name: String,
    },
}

/// Serializable form of an [`IdentityKernel`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct KernelSpec {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub core_values: Vec<String>,
    #[serde(default)]
    pub communication_style: String,
    #[serde(default)]
    pub expertise_domains: Vec<String>,
    #[serde(default)]
    pub invariants: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
struct RawKernelSpec {
    name: String,
    role: String,
    #[serde(default)]
    core_values: Vec<String>,
    #[serde(default)]
    communication_style: String,
    #[serde(default)]
    expertise_domains: Vec<String>,
    #[serde(default)]
    invariants: Vec<serde_json::Value>,
}

impl KernelSpec {
    /// Parse a kernel document, reporting the index of the first rule whose shape is unknown.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the document is not valid JSON for a kernel,
    /// or [`KernelError::MalformedRule`] when a rule matches no known shape.
    pub fn from_json(raw: &str) -> Result<Self, KernelError> {
        let document: RawKernelSpec = serde_json::from_str(raw)
            .map_err(|err| KernelError::Validation(format!("invalid kernel document: {err}")))?;

        let mut invariants = Vec::with_capacity(document.invariants.len());
        for (index, value) in document.invariants.into_iter().enumerate() {
            let rule = serde_json::from_value::<RuleSpec>(value)
                .map_err(|err| KernelError::MalformedRule { index, reason: err.to_string() })?;
            invariants.push(rule);
        }

        Ok(Self {
            name: document.name,
            role: document.role,
            core_values: document.core_values,
            communication_style: document.communication_style,
            expertise_domains: document.expertise_domains,
            invariants,
        })
    }
}

/// Named predicates that kernel documents may reference.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: BTreeMap<String, PredicateFn>,
}

impl PredicateRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `non_empty` and `no_control_chars`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("non_empty", |text| !text.trim().is_empty());
        registry.register("no_control_chars", |text| {
            !text.chars().any(|ch| ch.is_control() && !matches!(ch, '\n' | '\r' | '\t'))
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, check: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), infallible(check));
    }

    pub fn register_fallible<F>(&mut self, name: impl Into<String>, check: F)
    where
        F: Fn(&str) -> Result<bool, PredicateError> + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(check));
    }

    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<InvariantRule> {
        self.predicates.get(name).map(|check| {
            InvariantRule::Predicate(PredicateRule::new(Some(name.to_string()), Arc::clone(check)))
        })
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.predicates.keys().map(String::as_str)
    }
}

impl Debug for PredicateRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateRegistry")
            .field("predicates", &self.predicates.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> KernelSpec {
        match KernelSpec::from_json(raw) {
            Ok(spec) => spec,
            Err(err) => panic!("kernel document should parse: {err}"),
        }
    }

    #[test]
    fn pattern_rules_without_id_receive_entry_index() {
        let spec = parse(
            r#"{
                "name": "Guide",
                "role": "tutor",
                "invariants": [
                    {"type": "predicate", "name": "non_empty"},
                    {"type": "contains", "pattern": "Disclaimer"}
                ]
            }"#,
        );
        let kernel = match IdentityKernel::from_spec(&spec, &PredicateRegistry::with_builtins()) {
            Ok(kernel) => kernel,
            Err(err) => panic!("kernel should build: {err}"),
        };

        let InvariantRule::Pattern(pattern) = &kernel.invariants[1] else {
            panic!("second rule should be a pattern rule");
        };
        assert_eq!(pattern.id(), "entry_1");
        assert_eq!(pattern.kind(), PatternKind::Contains);
        assert_eq!(pattern.pattern(), "Disclaimer");
        assert!(pattern.occurs_in("see the disclaimer below"));
    }

    #[test]
    fn unknown_rule_type_is_rejected_with_index() {
        let err = match KernelSpec::from_json(
            r#"{"name": "Guide", "role": "tutor", "invariants": [
                {"type": "contains_not", "id": "p1", "pattern": "illegal"},
                {"type": "regex", "pattern": "a+"}
            ]}"#,
        ) {
            Ok(spec) => panic!("unknown rule type should be rejected: {spec:?}"),
            Err(err) => err,
        };

        assert!(matches!(err, KernelError::MalformedRule { index: 1, .. }), "got {err:?}");
    }

    #[test]
    fn rule_without_pattern_is_rejected() {
        let err = match KernelSpec::from_json(
            r#"{"name": "Guide", "role": "tutor", "invariants": [{"type": "contains", "id": "p1"}]}"#,
        ) {
            Ok(spec) => panic!("missing pattern should be rejected: {spec:?}"),
            Err(err) => err,
        };
        assert!(matches!(err, KernelError::MalformedRule { index: 0, .. }), "got {err:?}");
    }

    #[test]
    fn empty_pattern_is_rejected_at_construction() {
        let spec = parse(
            r#"{"name": "Guide", "role": "tutor", "invariants": [{"type": "contains_not", "pattern": "  "}]}"#,
        );
        let result = IdentityKernel::from_spec(&spec, &PredicateRegistry::new());
        assert!(matches!(result, Err(KernelError::MalformedRule { index: 0, .. })));
    }

    #[test]
    fn unregistered_predicate_is_rejected() {
        let spec = parse(
            r#"{"name": "Guide", "role": "tutor", "invariants": [{"type": "predicate", "name": "is_polite"}]}"#,
        );
        let Err(err) = IdentityKernel::from_spec(&spec, &PredicateRegistry::with_builtins()) else {
            panic!("unregistered predicate should be rejected");
        };
        assert_eq!(
            err,
            KernelError::MalformedRule {
                index: 0,
                reason: "predicate `is_polite` is not registered".to_string()
            }
        );
    }

    #[test]
    fn blank_name_is_rejected() {
        let spec = parse(r#"{"name": " ", "role": "tutor"}"#);
        let result = IdentityKernel::from_spec(&spec, &PredicateRegistry::new());
        assert!(matches!(result, Err(KernelError::Validation(_))));
    }

    #[test]
    fn to_spec_round_trips_named_rules() {
        let spec = parse(
            r#"{
                "name": "Guide",
                "role": "tutor",
                "core_values": ["patience"],
                "communication_style": "warm",
                "expertise_domains": ["math"],
                "invariants": [
                    {"type": "contains_not", "id": "p1", "pattern": "illegal"},
                    {"type": "predicate", "name": "no_control_chars"}
                ]
            }"#,
        );
        let registry = PredicateRegistry::with_builtins();
        let kernel = match IdentityKernel::from_spec(&spec, &registry) {
            Ok(kernel) => kernel,
            Err(err) => panic!("kernel should build: {err}"),
        };
        let back = match kernel.to_spec() {
            Ok(back) => back,
            Err(err) => panic!("named rules should convert back: {err}"),
        };
        assert_eq!(back, spec);
    }

    #[test]
    fn to_spec_rejects_anonymous_predicate() {
        let kernel = IdentityKernel {
            name: "Guide".to_string(),
            role: "tutor".to_string(),
            core_values: vec![],
            communication_style: String::new(),
            expertise_domains: vec![],
            invariants: vec![InvariantRule::anonymous_predicate(|_| Ok(true))],
        };
        assert!(matches!(kernel.to_spec(), Err(KernelError::Validation(_))));
    }

    #[test]
    fn builtin_predicates_behave() {
        let registry = PredicateRegistry::with_builtins();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["no_control_chars", "non_empty"]);

        let Some(InvariantRule::Predicate(non_empty)) = registry.resolve("non_empty") else {
            panic!("non_empty should resolve to a predicate");
        };
        assert_eq!(non_empty.check("  \n"), Ok(false));
        assert_eq!(non_empty.check("hello"), Ok(true));

        let Some(InvariantRule::Predicate(no_control)) = registry.resolve("no_control_chars")
        else {
            panic!("no_control_chars should resolve to a predicate");
        };
        assert_eq!(no_control.check("line one\nline two\t"), Ok(true));
        assert_eq!(no_control.check("bell\u{7}"), Ok(false));
    }
}
