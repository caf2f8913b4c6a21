//! Backend selection.
//!
//! Routing is pure: a job plus the static rule list always yields the same
//! [`RouteDecision`]. Rule conditions are structured `{field, op, value}`
//! predicates over a closed set of job fields, so configuration can never
//! execute code.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::RouterConfig;
use crate::error::{OrchestratorError, Result};
use crate::state_machine::{JobSpec, OutputQuality};

/// The execution paths a job can be sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Interactive design-tool automation. Single instance.
    DesignAutomation,
    /// Serverless document-generation API.
    Serverless,
    /// Ordered multi-provider workflow. Shares the design-tool resource.
    Workflow,
}

impl BackendKind {
    /// Whether calls must go through the execution serializer.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, BackendKind::DesignAutomation | BackendKind::Workflow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::DesignAutomation => "design_automation",
            BackendKind::Serverless => "serverless",
            BackendKind::Workflow => "workflow",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job fields visible to rule predicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Field {
    JobType,
    Style,
    Tags,
    Quality,
    Format,
    Session,
    WorkflowName,
    WorkflowProviders,
    WorldClass,
    Experiment,
    Hint(String),
}

impl TryFrom<String> for Field {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let field = match value.as_str() {
            "job_type" => Field::JobType,
            "style" => Field::Style,
            "tags" => Field::Tags,
            "quality" => Field::Quality,
            "format" => Field::Format,
            "session" => Field::Session,
            "workflow_name" => Field::WorkflowName,
            "workflow_providers" => Field::WorkflowProviders,
            "world_class" => Field::WorldClass,
            "experiment" => Field::Experiment,
            other => match other.strip_prefix("hint:") {
                Some(key) if !key.is_empty() => Field::Hint(key.to_string()),
                _ => return Err(format!("unknown rule field '{other}'")),
            },
        };
        Ok(field)
    }
}

impl From<Field> for String {
    fn from(field: Field) -> Self {
        match field {
            Field::JobType => "job_type".into(),
            Field::Style => "style".into(),
            Field::Tags => "tags".into(),
            Field::Quality => "quality".into(),
            Field::Format => "format".into(),
            Field::Session => "session".into(),
            Field::WorkflowName => "workflow_name".into(),
            Field::WorkflowProviders => "workflow_providers".into(),
            Field::WorldClass => "world_class".into(),
            Field::Experiment => "experiment".into(),
            Field::Hint(key) => format!("hint:{key}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    In,
    Contains,
    Exists,
    Missing,
}

/// Literal a predicate compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Flag(bool),
    Text(String),
    List(Vec<String>),
}

/// A resolved job field.
#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Absent,
    Flag(bool),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    fn present(&self) -> bool {
        match self {
            FieldValue::Absent => false,
            FieldValue::Flag(b) => *b,
            FieldValue::Text(s) => !s.is_empty(),
            FieldValue::List(items) => !items.is_empty(),
        }
    }
}

fn text_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: Field,
    pub op: Operator,
    #[serde(default)]
    pub value: Option<RuleValue>,
}

impl Predicate {
    pub fn new(field: Field, op: Operator, value: Option<RuleValue>) -> Self {
        Self { field, op, value }
    }

    pub fn matches(&self, job: &JobSpec) -> bool {
        let actual = resolve(&self.field, job);
        match self.op {
            Operator::Exists => actual.present(),
            Operator::Missing => !actual.present(),
            Operator::Eq => self.equals(&actual),
            Operator::Ne => !self.equals(&actual),
            Operator::In => match (&actual, &self.value) {
                (FieldValue::Text(s), Some(RuleValue::List(options))) => {
                    options.iter().any(|o| text_eq(o, s))
                }
                (FieldValue::List(items), Some(RuleValue::List(options))) => items
                    .iter()
                    .any(|item| options.iter().any(|o| text_eq(o, item))),
                _ => false,
            },
            Operator::Contains => match (&actual, &self.value) {
                (FieldValue::List(items), Some(RuleValue::Text(needle))) => {
                    items.iter().any(|item| text_eq(item, needle))
                }
                (FieldValue::Text(s), Some(RuleValue::Text(needle))) => s
                    .to_ascii_lowercase()
                    .contains(&needle.to_ascii_lowercase()),
                _ => false,
            },
        }
    }

    fn equals(&self, actual: &FieldValue) -> bool {
        match (actual, &self.value) {
            (FieldValue::Text(a), Some(RuleValue::Text(b))) => text_eq(a, b),
            (FieldValue::Flag(a), Some(RuleValue::Flag(b))) => a == b,
            (FieldValue::List(a), Some(RuleValue::List(b))) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| text_eq(x, y))
            }
            _ => false,
        }
    }
}

fn resolve(field: &Field, job: &JobSpec) -> FieldValue {
    fn opt(value: Option<&String>) -> FieldValue {
        value.map_or(FieldValue::Absent, |s| FieldValue::Text(s.clone()))
    }

    match field {
        Field::JobType => FieldValue::Text(job.job_type.clone()),
        Field::Style => opt(job.style.as_ref()),
        Field::Tags => FieldValue::List(job.tags.clone()),
        Field::Quality => FieldValue::Text(job.output.quality.as_str().to_string()),
        Field::Format => FieldValue::Text(job.output.format.clone()),
        Field::Session => opt(job.mode.session.as_ref()),
        Field::WorkflowName => opt(job.workflow.as_ref().map(|w| &w.name)),
        Field::WorkflowProviders => job
            .workflow
            .as_ref()
            .map_or(FieldValue::Absent, |w| FieldValue::List(w.providers.clone())),
        Field::WorldClass => FieldValue::Flag(job.mode.world_class),
        Field::Experiment => FieldValue::Flag(job.mode.experiment),
        Field::Hint(key) => opt(job.hints.get(key)),
    }
}

/// A named rule; all predicates must match. An empty list matches every job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    #[serde(default)]
    pub when: Vec<Predicate>,
    pub backend: BackendKind,
}

impl RoutingRule {
    pub fn matches(&self, job: &JobSpec) -> bool {
        self.when.iter().all(|p| p.matches(job))
    }
}

/// Why a backend was chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteReason {
    MandatoryWorkflow { tag: String },
    Rule { name: String },
    Default,
    /// The serverless choice was replaced for a premium, high-quality job.
    Guardrail { overridden: Box<RouteReason> },
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteReason::MandatoryWorkflow { tag } => write!(f, "mandatory workflow for '{tag}'"),
            RouteReason::Rule { name } => write!(f, "rule '{name}'"),
            RouteReason::Default => write!(f, "default backend"),
            RouteReason::Guardrail { overridden } => {
                write!(f, "premium quality guardrail (overrode {overridden})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub backend: BackendKind,
    pub reason: RouteReason,
}

/// Maps jobs to backends.
#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<RoutingRule>,
    default_backend: Option<BackendKind>,
    mandatory_workflow_styles: Vec<String>,
    premium_job_types: Vec<String>,
}

impl Router {
    pub fn new(
        rules: Vec<RoutingRule>,
        default_backend: Option<BackendKind>,
        mandatory_workflow_styles: Vec<String>,
        premium_job_types: Vec<String>,
    ) -> Self {
        Self {
            rules,
            default_backend,
            mandatory_workflow_styles,
            premium_job_types,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(
            config.rules.clone(),
            config.default_backend,
            config.mandatory_workflow_styles.clone(),
            config.premium_job_types.clone(),
        )
    }

    /// Picks the backend for `job`.
    ///
    /// Order: mandatory workflow override, then rules in declared order, then
    /// the default. The premium guardrail is applied to whatever the rules or
    /// default produced and cannot be switched off by a rule.
    pub fn route(&self, job: &JobSpec) -> Result<RouteDecision> {
        if let Some(tag) = self.mandatory_tag(job) {
            return Ok(RouteDecision {
                backend: BackendKind::Workflow,
                reason: RouteReason::MandatoryWorkflow { tag },
            });
        }

        let decision = match self.rules.iter().find(|r| r.matches(job)) {
            Some(rule) => RouteDecision {
                backend: rule.backend,
                reason: RouteReason::Rule {
                    name: rule.name.clone(),
                },
            },
            None => match self.default_backend {
                Some(backend) => RouteDecision {
                    backend,
                    reason: RouteReason::Default,
                },
                None => {
                    return Err(OrchestratorError::RoutingFailed {
                        job_id: job.job_id.clone(),
                        reason: "no rule matched and no default backend is configured".into(),
                    });
                }
            },
        };

        Ok(self.apply_guardrail(job, decision))
    }

    fn apply_guardrail(&self, job: &JobSpec, decision: RouteDecision) -> RouteDecision {
        if decision.backend == BackendKind::Serverless && self.is_premium_high_quality(job) {
            return RouteDecision {
                backend: BackendKind::DesignAutomation,
                reason: RouteReason::Guardrail {
                    overridden: Box::new(decision.reason),
                },
            };
        }
        decision
    }

    fn is_premium_high_quality(&self, job: &JobSpec) -> bool {
        job.output.quality == OutputQuality::High
            && self
                .premium_job_types
                .iter()
                .any(|t| text_eq(t, &job.job_type))
    }

    /// The style, tag or workflow name that forces the workflow backend.
    fn mandatory_tag(&self, job: &JobSpec) -> Option<String> {
        let candidates = job
            .style
            .iter()
            .chain(job.tags.iter())
            .chain(job.workflow.as_ref().map(|w| &w.name));
        for candidate in candidates {
            if self
                .mandatory_workflow_styles
                .iter()
                .any(|m| text_eq(m, candidate))
            {
                return Some(candidate.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::WorkflowSpec;

    fn rule(name: &str, backend: BackendKind, when: Vec<Predicate>) -> RoutingRule {
        RoutingRule {
            name: name.into(),
            when,
            backend,
        }
    }

    fn eq(field: Field, value: &str) -> Predicate {
        Predicate::new(field, Operator::Eq, Some(RuleValue::Text(value.into())))
    }

    fn router(rules: Vec<RoutingRule>, default: Option<BackendKind>) -> Router {
        Router::new(
            rules,
            default,
            vec!["TFU".into()],
            vec!["partnership".into(), "premium".into()],
        )
    }

    #[test]
    fn first_matching_rule_wins() {
        let r = router(
            vec![
                rule("drafts", BackendKind::Serverless, vec![eq(Field::Quality, "draft")]),
                rule("briefs", BackendKind::DesignAutomation, vec![eq(Field::JobType, "brief")]),
            ],
            None,
        );
        let mut job = JobSpec::new("j", "brief");
        job.output.quality = OutputQuality::Draft;

        let d = r.route(&job).unwrap();
        assert_eq!(d.backend, BackendKind::Serverless);
        assert_eq!(d.reason, RouteReason::Rule { name: "drafts".into() });
    }

    #[test]
    fn falls_back_to_default() {
        let r = router(Vec::new(), Some(BackendKind::Serverless));
        let d = r.route(&JobSpec::new("j", "flyer")).unwrap();
        assert_eq!(d.backend, BackendKind::Serverless);
        assert_eq!(d.reason, RouteReason::Default);
    }

    #[test]
    fn no_rule_and_no_default_is_routing_failure() {
        let r = router(Vec::new(), None);
        let err = r.route(&JobSpec::new("j", "flyer")).unwrap_err();
        assert!(matches!(err, OrchestratorError::RoutingFailed { .. }));
    }

    #[test]
    fn mandatory_style_routes_to_workflow_without_rules() {
        let r = router(Vec::new(), None);
        let mut job = JobSpec::new("j", "partnership");
        job.style = Some("TFU".into());

        let d = r.route(&job).unwrap();
        assert_eq!(d.backend, BackendKind::Workflow);
        assert_eq!(
            d.reason,
            RouteReason::MandatoryWorkflow { tag: "TFU".into() }
        );
    }

    #[test]
    fn mandatory_style_beats_matching_rule() {
        let catch_all = rule("everything-serverless", BackendKind::Serverless, Vec::new());
        let r = router(vec![catch_all], None);
        let mut job = JobSpec::new("j", "brief");
        job.tags = vec!["tfu".into()];

        assert_eq!(r.route(&job).unwrap().backend, BackendKind::Workflow);
    }

    #[test]
    fn mandatory_workflow_name_is_honoured() {
        let r = router(Vec::new(), Some(BackendKind::Serverless));
        let mut job = JobSpec::new("j", "brief");
        job.workflow = Some(WorkflowSpec {
            name: "TFU".into(),
            providers: vec!["copy".into()],
        });
        assert_eq!(r.route(&job).unwrap().backend, BackendKind::Workflow);
    }

    #[test]
    fn guardrail_overrides_serverless_for_premium_high_quality() {
        let r = router(
            vec![rule("cheap", BackendKind::Serverless, vec![eq(Field::JobType, "partnership")])],
            None,
        );
        let mut job = JobSpec::new("j", "partnership");
        job.output.quality = OutputQuality::High;

        let d = r.route(&job).unwrap();
        assert_eq!(d.backend, BackendKind::DesignAutomation);
        assert!(matches!(d.reason, RouteReason::Guardrail { .. }));
    }

    #[test]
    fn guardrail_leaves_standard_quality_alone() {
        let r = router(
            vec![rule("cheap", BackendKind::Serverless, Vec::new())],
            None,
        );
        let job = JobSpec::new("j", "partnership");
        assert_eq!(r.route(&job).unwrap().backend, BackendKind::Serverless);
    }

    #[test]
    fn guardrail_also_applies_to_default() {
        let r = router(Vec::new(), Some(BackendKind::Serverless));
        let mut job = JobSpec::new("j", "premium");
        job.output.quality = OutputQuality::High;
        assert_eq!(r.route(&job).unwrap().backend, BackendKind::DesignAutomation);
    }

    #[test]
    fn operators_cover_lists_flags_and_hints() {
        let mut job = JobSpec::new("j", "flyer");
        job.tags = vec!["print".into(), "a4".into()];
        job.mode.world_class = true;
        job.hints.insert("region".into(), "eu-west".into());

        let in_op = Predicate::new(
            Field::JobType,
            Operator::In,
            Some(RuleValue::List(vec!["brief".into(), "FLYER".into()])),
        );
        assert!(in_op.matches(&job));

        let contains = Predicate::new(Field::Tags, Operator::Contains, Some(RuleValue::Text("A4".into())));
        assert!(contains.matches(&job));

        let flag = Predicate::new(Field::WorldClass, Operator::Eq, Some(RuleValue::Flag(true)));
        assert!(flag.matches(&job));

        let hint = Predicate::new(
            Field::Hint("region".into()),
            Operator::Contains,
            Some(RuleValue::Text("eu".into())),
        );
        assert!(hint.matches(&job));

        let missing = Predicate::new(Field::Session, Operator::Missing, None);
        assert!(missing.matches(&job));

        let exists = Predicate::new(Field::WorkflowProviders, Operator::Exists, None);
        assert!(!exists.matches(&job));

        let ne = Predicate::new(Field::Style, Operator::Ne, Some(RuleValue::Text("bold".into())));
        assert!(ne.matches(&job));
    }

    #[test]
    fn field_names_round_trip_through_strings() {
        let field = Field::try_from("hint:tier".to_string()).unwrap();
        assert_eq!(field, Field::Hint("tier".into()));
        assert_eq!(String::from(field), "hint:tier");
        assert!(Field::try_from("eval(job)".to_string()).is_err());
        assert!(Field::try_from("hint:".to_string()).is_err());
    }

    #[test]
    fn routing_is_deterministic() {
        let r = router(
            vec![rule("drafts", BackendKind::Serverless, vec![eq(Field::Quality, "draft")])],
            Some(BackendKind::DesignAutomation),
        );
        let job = JobSpec::new("j", "brief");
        let first = r.route(&job).unwrap();
        for _ in 0..10 {
            assert_eq!(r.route(&job).unwrap(), first);
        }
    }
}
