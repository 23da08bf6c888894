//! Grimoires: declarative workflow templates.
//!
//! A grimoire document is YAML. Parsing converts the loose document shape into the
//! closed [`Step`] sum type, failing on missing per-kind fields, bad durations and
//! bad `when` expressions. [`Grimoire::validate`] then checks the structural rules
//! (non-empty name/description/steps, sibling-unique step names at every level).

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::condition::Condition;
use crate::duration::parse_duration;

/// Default window for agent steps.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Default window for script steps.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default window for loop and merge steps.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default budget for a whole workflow.
pub const DEFAULT_WORKFLOW_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum GrimoireError {
    /// The document could not be parsed at all.
    #[error("{source_name}: malformed grimoire: {message}")]
    Malformed { source_name: String, message: String },
    /// A field is missing or holds an invalid value.
    #[error("{source_name}: {field}: {message}")]
    InvalidField {
        source_name: String,
        field: String,
        message: String,
    },
    #[error("{source_name}: duplicate step name '{name}' at {field}")]
    DuplicateStep {
        source_name: String,
        field: String,
        name: String,
    },
    #[error("unknown grimoire: {0}")]
    NotFound(String),
    #[error("failed to read grimoire {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl GrimoireError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    fn field(source_name: &str, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            source_name: source_name.to_string(),
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GrimoireError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Agent,
    Script,
    Loop,
    Merge,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Script => "script",
            Self::Loop => "loop",
            Self::Merge => "merge",
        }
    }
}

/// What a failing script does to the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFail {
    Continue,
    #[default]
    Block,
}

/// What a succeeding script does to its enclosing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnSuccess {
    ExitLoop,
}

/// What a loop does once `max_iterations` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMaxIterations {
    /// Block the workflow.
    #[default]
    Block,
    /// Proceed past the loop.
    Exit,
    /// Proceed past the loop and record that the cap was hit.
    Continue,
}

/// Fields shared by every step kind.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCommon {
    pub name: String,
    pub timeout: Option<Duration>,
    pub when: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentStep {
    pub common: StepCommon,
    /// Spell name or inline prompt text.
    pub spell: String,
    /// Named bindings rendered into the prompt context as `input.<name>`.
    pub input: BTreeMap<String, String>,
    /// Name the agent result is stored under in the workflow outputs.
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptStep {
    pub common: StepCommon,
    pub command: String,
    pub on_fail: OnFail,
    pub on_success: Option<OnSuccess>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopStep {
    pub common: StepCommon,
    pub steps: Vec<Step>,
    pub max_iterations: u32,
    pub on_max_iterations: OnMaxIterations,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeStep {
    pub common: StepCommon,
    pub require_review: bool,
}

/// One unit of work in a grimoire.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Agent(AgentStep),
    Script(ScriptStep),
    Loop(LoopStep),
    Merge(MergeStep),
}

impl Step {
    pub fn common(&self) -> &StepCommon {
        match self {
            Self::Agent(s) => &s.common,
            Self::Script(s) => &s.common,
            Self::Loop(s) => &s.common,
            Self::Merge(s) => &s.common,
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Self::Agent(_) => StepKind::Agent,
            Self::Script(_) => StepKind::Script,
            Self::Loop(_) => StepKind::Loop,
            Self::Merge(_) => StepKind::Merge,
        }
    }

    pub fn when(&self) -> Option<&Condition> {
        self.common().when.as_ref()
    }

    /// The step's window: its explicit timeout or the per-kind default.
    pub fn timeout(&self) -> Duration {
        self.common().timeout.unwrap_or(match self.kind() {
            StepKind::Agent => DEFAULT_AGENT_TIMEOUT,
            StepKind::Script => DEFAULT_SCRIPT_TIMEOUT,
            StepKind::Loop | StepKind::Merge => DEFAULT_CONTROL_TIMEOUT,
        })
    }

    /// Resolve a step by index path (e.g. `[1, 0]` is the first step inside the second).
    pub fn resolve<'a>(steps: &'a [Step], path: &[usize]) -> Option<&'a Step> {
        let (first, rest) = path.split_first()?;
        let step = steps.get(*first)?;
        if rest.is_empty() {
            return Some(step);
        }
        match step {
            Self::Loop(l) => Self::resolve(&l.steps, rest),
            _ => None,
        }
    }
}

/// A validated workflow template.
#[derive(Debug, Clone, PartialEq)]
pub struct Grimoire {
    pub name: String,
    pub description: String,
    pub timeout: Option<Duration>,
    pub steps: Vec<Step>,
}

impl Grimoire {
    /// Parse and validate a YAML document.
    ///
    /// `source_name` is used in error messages (usually the file path or stem).
    pub fn from_yaml(source: &str, source_name: &str) -> Result<Self> {
        let grimoire = Self::parse(source, source_name)?;
        grimoire.validate(source_name)?;
        Ok(grimoire)
    }

    /// Parse a YAML document into the typed model without structural validation.
    pub fn parse(source: &str, source_name: &str) -> Result<Self> {
        let raw: RawGrimoire =
            serde_yaml::from_str(source).map_err(|e| GrimoireError::Malformed {
                source_name: source_name.to_string(),
                message: e.to_string(),
            })?;

        let timeout = raw
            .timeout
            .as_deref()
            .map(|t| {
                parse_duration(t)
                    .map_err(|e| GrimoireError::field(source_name, "timeout", e.to_string()))
            })
            .transpose()?;

        let steps = raw
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| step.into_step(source_name, &format!("steps[{i}]")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: raw.name.unwrap_or_default(),
            description: raw.description.unwrap_or_default(),
            timeout,
            steps,
        })
    }

    /// Check the structural rules. Applied recursively to loop bodies.
    pub fn validate(&self, source_name: &str) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GrimoireError::field(source_name, "name", "must not be empty"));
        }
        if self.description.trim().is_empty() {
            return Err(GrimoireError::field(
                source_name,
                "description",
                "must not be empty",
            ));
        }
        if self.steps.is_empty() {
            return Err(GrimoireError::field(
                source_name,
                "steps",
                "at least one step is required",
            ));
        }
        validate_steps(&self.steps, source_name, "steps")
    }

    /// Overall workflow budget, defaulting to one hour.
    pub fn workflow_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_WORKFLOW_TIMEOUT)
    }

    /// Step at an index path.
    pub fn step_at(&self, path: &[usize]) -> Option<&Step> {
        Step::resolve(&self.steps, path)
    }
}

fn validate_steps(steps: &[Step], source_name: &str, prefix: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for (i, step) in steps.iter().enumerate() {
        let field = format!("{prefix}[{i}]");
        let name = step.name();
        if name.trim().is_empty() {
            return Err(GrimoireError::field(
                source_name,
                format!("{field}.name"),
                "must not be empty",
            ));
        }
        if !seen.insert(name) {
            return Err(GrimoireError::DuplicateStep {
                source_name: source_name.to_string(),
                field,
                name: name.to_string(),
            });
        }
        if let Step::Loop(l) = step {
            if l.steps.is_empty() {
                return Err(GrimoireError::field(
                    source_name,
                    format!("{field}.steps"),
                    "loop steps require at least one nested step",
                ));
            }
            validate_steps(&l.steps, source_name, &format!("{field}.steps"))?;
        }
    }
    Ok(())
}

// --- Document shape ---

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGrimoire {
    name: Option<String>,
    description: Option<String>,
    timeout: Option<String>,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    timeout: Option<String>,
    when: Option<String>,
    // agent
    spell: Option<String>,
    #[serde(default)]
    input: BTreeMap<String, String>,
    output: Option<String>,
    // script
    command: Option<String>,
    on_fail: Option<String>,
    on_success: Option<String>,
    // loop
    steps: Option<Vec<RawStep>>,
    max_iterations: Option<i64>,
    on_max_iterations: Option<String>,
    // merge
    require_review: Option<bool>,
}

impl RawStep {
    fn into_step(self, source_name: &str, field: &str) -> Result<Step> {
        let err = |sub: &str, message: String| {
            GrimoireError::field(source_name, format!("{field}.{sub}"), message)
        };
        let forbid = |present: bool, sub: &str, kind: &str| {
            if present {
                Err(err(sub, format!("not valid for {kind} steps")))
            } else {
                Ok(())
            }
        };

        let timeout = self
            .timeout
            .as_deref()
            .map(|t| parse_duration(t).map_err(|e| err("timeout", e.to_string())))
            .transpose()?;
        let when = self
            .when
            .as_deref()
            .map(|w| Condition::parse(w).map_err(|e| err("when", e.to_string())))
            .transpose()?;
        let common = StepCommon {
            name: self.name.unwrap_or_default(),
            timeout,
            when,
        };

        let kind = self
            .kind
            .ok_or_else(|| err("type", "required (agent, script, loop or merge)".to_string()))?;

        match kind.as_str() {
            "agent" => {
                forbid(self.command.is_some(), "command", "agent")?;
                forbid(self.steps.is_some(), "steps", "agent")?;
                let spell = self
                    .spell
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| err("spell", "required for agent steps".to_string()))?;
                Ok(Step::Agent(AgentStep {
                    common,
                    spell,
                    input: self.input,
                    output: self.output,
                }))
            }
            "script" => {
                forbid(self.spell.is_some(), "spell", "script")?;
                forbid(self.steps.is_some(), "steps", "script")?;
                let command = self
                    .command
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| err("command", "required for script steps".to_string()))?;
                let on_fail = match self.on_fail.as_deref() {
                    None | Some("block") => OnFail::Block,
                    Some("continue") => OnFail::Continue,
                    Some(other) => {
                        return Err(err(
                            "on_fail",
                            format!("must be 'continue' or 'block', got '{other}'"),
                        ))
                    }
                };
                let on_success = match self.on_success.as_deref() {
                    None => None,
                    Some("exit_loop") => Some(OnSuccess::ExitLoop),
                    Some(other) => {
                        return Err(err(
                            "on_success",
                            format!("must be 'exit_loop', got '{other}'"),
                        ))
                    }
                };
                Ok(Step::Script(ScriptStep {
                    common,
                    command,
                    on_fail,
                    on_success,
                }))
            }
            "loop" => {
                forbid(self.spell.is_some(), "spell", "loop")?;
                forbid(self.command.is_some(), "command", "loop")?;
                let raw_steps = self
                    .steps
                    .ok_or_else(|| err("steps", "required for loop steps".to_string()))?;
                let max_iterations = match self.max_iterations {
                    None => {
                        return Err(err(
                            "max_iterations",
                            "required for loop steps".to_string(),
                        ))
                    }
                    Some(n) => u32::try_from(n)
                        .map_err(|_| err("max_iterations", format!("must be >= 0, got {n}")))?,
                };
                let on_max_iterations = match self.on_max_iterations.as_deref() {
                    None | Some("block") => OnMaxIterations::Block,
                    Some("exit") => OnMaxIterations::Exit,
                    Some("continue") => OnMaxIterations::Continue,
                    Some(other) => {
                        return Err(err(
                            "on_max_iterations",
                            format!("must be 'block', 'exit' or 'continue', got '{other}'"),
                        ))
                    }
                };
                let steps = raw_steps
                    .into_iter()
                    .enumerate()
                    .map(|(i, s)| s.into_step(source_name, &format!("{field}.steps[{i}]")))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Step::Loop(LoopStep {
                    common,
                    steps,
                    max_iterations,
                    on_max_iterations,
                }))
            }
            "merge" => {
                forbid(self.spell.is_some(), "spell", "merge")?;
                forbid(self.command.is_some(), "command", "merge")?;
                forbid(self.steps.is_some(), "steps", "merge")?;
                Ok(Step::Merge(MergeStep {
                    common,
                    require_review: self.require_review.unwrap_or(true),
                }))
            }
            other => Err(err(
                "type",
                format!("unknown step type '{other}' (expected agent, script, loop or merge)"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
name: implement-and-test
description: Implement, iterate on tests, then merge
timeout: 2h
steps:
  - name: implement
    type: agent
    spell: implement
    output: implementation
  - name: test-loop
    type: loop
    max_iterations: 3
    on_max_iterations: block
    steps:
      - name: run-tests
        type: script
        command: cargo test
        on_fail: continue
        on_success: exit_loop
      - name: fix-tests
        type: agent
        spell: fix-tests
        when: previous.failed
        input:
          failures: "{{ outputs.run-tests.output }}"
  - name: merge
    type: merge
    require_review: true
"#;

    #[test]
    fn parses_all_step_kinds() {
        let g = Grimoire::from_yaml(EXAMPLE, "example").unwrap();
        assert_eq!(g.name, "implement-and-test");
        assert_eq!(g.workflow_timeout(), Duration::from_secs(7200));
        assert_eq!(g.steps.len(), 3);

        let Step::Agent(implement) = &g.steps[0] else {
            panic!("expected agent step");
        };
        assert_eq!(implement.output.as_deref(), Some("implementation"));
        assert_eq!(g.steps[0].timeout(), DEFAULT_AGENT_TIMEOUT);

        let Step::Loop(l) = &g.steps[1] else {
            panic!("expected loop step");
        };
        assert_eq!(l.max_iterations, 3);
        assert_eq!(l.on_max_iterations, OnMaxIterations::Block);
        let Step::Script(run_tests) = &l.steps[0] else {
            panic!("expected script step");
        };
        assert_eq!(run_tests.on_fail, OnFail::Continue);
        assert_eq!(run_tests.on_success, Some(OnSuccess::ExitLoop));
        assert_eq!(l.steps[1].when().unwrap().source(), "previous.failed");

        let Step::Merge(m) = &g.steps[2] else {
            panic!("expected merge step");
        };
        assert!(m.require_review);
    }

    #[test]
    fn resolves_step_paths() {
        let g = Grimoire::from_yaml(EXAMPLE, "example").unwrap();
        assert_eq!(g.step_at(&[1, 1]).unwrap().name(), "fix-tests");
        assert_eq!(g.step_at(&[2]).unwrap().name(), "merge");
        assert!(g.step_at(&[0, 0]).is_none());
        assert!(g.step_at(&[9]).is_none());
        assert!(g.step_at(&[]).is_none());
    }

    #[test]
    fn defaults_apply() {
        let src = r#"
name: minimal
description: d
steps:
  - name: check
    type: script
    command: "true"
  - name: ship
    type: merge
"#;
        let g = Grimoire::from_yaml(src, "minimal").unwrap();
        assert_eq!(g.workflow_timeout(), DEFAULT_WORKFLOW_TIMEOUT);
        let Step::Script(s) = &g.steps[0] else {
            panic!("expected script");
        };
        assert_eq!(s.on_fail, OnFail::Block);
        assert_eq!(g.steps[0].timeout(), DEFAULT_SCRIPT_TIMEOUT);
        let Step::Merge(m) = &g.steps[1] else {
            panic!("expected merge");
        };
        assert!(m.require_review);
        assert_eq!(g.steps[1].timeout(), DEFAULT_CONTROL_TIMEOUT);
    }

    #[test]
    fn all_on_max_iterations_values_are_accepted() {
        for value in ["block", "exit", "continue"] {
            let src = format!(
                "name: n\ndescription: d\nsteps:\n  - name: l\n    type: loop\n    max_iterations: 0\n    on_max_iterations: {value}\n    steps:\n      - name: s\n        type: script\n        command: \"true\"\n"
            );
            assert!(Grimoire::from_yaml(&src, "n").is_ok(), "{value} rejected");
        }
    }

    #[test]
    fn duplicate_names_inside_loop_are_rejected() {
        let src = r#"
name: dup
description: d
steps:
  - name: outer
    type: loop
    max_iterations: 2
    steps:
      - name: same
        type: script
        command: "true"
      - name: same
        type: script
        command: "false"
"#;
        let err = Grimoire::from_yaml(src, "dup").unwrap_err();
        assert!(matches!(err, GrimoireError::DuplicateStep { ref name, .. } if name == "same"));
        assert!(err.to_string().contains("same"));
    }

    #[test]
    fn same_name_at_different_levels_is_allowed() {
        let src = r#"
name: nested
description: d
steps:
  - name: check
    type: script
    command: "true"
  - name: again
    type: loop
    max_iterations: 1
    steps:
      - name: check
        type: script
        command: "true"
"#;
        assert!(Grimoire::from_yaml(src, "nested").is_ok());
    }

    #[test]
    fn bad_timeout_fails_at_load() {
        let src = "name: n\ndescription: d\nsteps:\n  - name: s\n    type: script\n    command: x\n    timeout: soon\n";
        let err = Grimoire::from_yaml(src, "n").unwrap_err();
        assert!(err.to_string().contains("steps[0].timeout"), "{err}");
    }

    #[test]
    fn bad_when_fails_at_load() {
        let src = "name: n\ndescription: d\nsteps:\n  - name: s\n    type: script\n    command: x\n    when: \"a &&\"\n";
        let err = Grimoire::from_yaml(src, "n").unwrap_err();
        assert!(err.to_string().contains("steps[0].when"), "{err}");
    }

    #[test]
    fn structural_rules_are_enforced() {
        let cases = [
            ("description: d\nsteps:\n  - {name: s, type: merge}\n", "name"),
            ("name: n\nsteps:\n  - {name: s, type: merge}\n", "description"),
            ("name: n\ndescription: d\nsteps: []\n", "steps"),
            ("name: n\ndescription: d\nsteps:\n  - {type: merge}\n", "steps[0].name"),
            (
                "name: n\ndescription: d\nsteps:\n  - {name: l, type: loop, max_iterations: 1, steps: []}\n",
                "steps[0].steps",
            ),
        ];
        for (src, field) in cases {
            let err = Grimoire::from_yaml(src, "n").unwrap_err();
            assert!(
                matches!(&err, GrimoireError::InvalidField { field: f, .. } if f == field),
                "expected field {field}, got {err}"
            );
        }
    }

    #[test]
    fn per_kind_required_fields_are_named() {
        let cases = [
            ("{name: a, type: agent}", "steps[0].spell"),
            ("{name: s, type: script}", "steps[0].command"),
            ("{name: l, type: loop, max_iterations: 1}", "steps[0].steps"),
            ("{name: l, type: loop, steps: [{name: s, type: merge}]}", "steps[0].max_iterations"),
            ("{name: x}", "steps[0].type"),
            ("{name: x, type: shell}", "steps[0].type"),
            ("{name: s, type: script, command: x, on_fail: retry}", "steps[0].on_fail"),
            ("{name: l, type: loop, max_iterations: -1, steps: [{name: s, type: merge}]}", "steps[0].max_iterations"),
            ("{name: m, type: merge, command: x}", "steps[0].command"),
        ];
        for (step, field) in cases {
            let src = format!("name: n\ndescription: d\nsteps:\n  - {step}\n");
            let err = Grimoire::from_yaml(&src, "n").unwrap_err();
            assert!(
                matches!(&err, GrimoireError::InvalidField { field: f, .. } if f == field),
                "expected field {field}, got {err}"
            );
        }
    }

    #[test]
    fn malformed_document_is_a_definition_error() {
        let err = Grimoire::from_yaml("name: [unclosed", "broken").unwrap_err();
        assert!(matches!(err, GrimoireError::Malformed { .. }));
        let err = Grimoire::from_yaml("name: n\nbogus: 1\n", "extra").unwrap_err();
        assert!(matches!(err, GrimoireError::Malformed { .. }));
    }
}
