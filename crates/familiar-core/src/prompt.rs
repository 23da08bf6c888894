//! Prompt assembly for agent steps.
//!
//! Spells are markdown templates with `{{ path }}` placeholders resolved against the
//! workflow context (`task.*`, `input.*`, `outputs.*`, `previous.*`). Missing values
//! render as empty strings.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::completion::COMPLETION_TOKEN;
use crate::condition::lookup;

/// Maximum length of the readable part of a task slug.
const SLUG_MAX_LEN: usize = 40;

/// Render `{{ path }}` placeholders in `template` from `context`.
pub fn render(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // Unterminated placeholder stays literal.
            out.push_str(&rest[start..]);
            return out;
        };

        let path: Vec<String> = after[..end]
            .trim()
            .split('.')
            .map(str::to_string)
            .collect();
        if let Some(value) = lookup(context, &path) {
            out.push_str(&value_to_text(value));
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// Build the full prompt for an agent step.
///
/// `inputs` are rendered against `context` first and exposed to the spell as
/// `input.<name>`. The task description and the completion instruction are appended.
pub fn build_agent_prompt(
    spell: &str,
    inputs: &BTreeMap<String, String>,
    context: &Value,
) -> String {
    let mut scope = context.clone();
    let rendered_inputs: serde_json::Map<String, Value> = inputs
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(render(v, context))))
        .collect();
    if let Value::Object(map) = &mut scope {
        map.insert("input".to_string(), Value::Object(rendered_inputs));
    }

    let mut prompt = render(spell, &scope).trim_end().to_string();
    prompt.push_str("\n\n## Task\n");

    let field = |name: &str| {
        lookup(context, &["task".to_string(), name.to_string()])
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string()
    };
    prompt.push_str(&format!("ID: {}\n", field("id")));
    for (label, name) in [
        ("Title", "title"),
        ("Description", "description"),
        ("Acceptance criteria", "acceptance_criteria"),
    ] {
        let value = field(name);
        if !value.is_empty() {
            prompt.push_str(&format!("\n### {label}\n{value}\n"));
        }
    }

    prompt.push_str(&format!(
        "\nWhen the work is finished, print a short `Summary:` line followed by \
         {COMPLETION_TOKEN} on a line by itself.\n"
    ));
    prompt
}

/// Sanitize a branch name for filesystem use (replace slashes with dashes).
pub fn sanitize_branch_name(branch: &str) -> String {
    branch.replace('/', "-")
}

/// Deterministic, filesystem- and ref-safe slug for a task id.
///
/// The readable prefix is lowercased with runs of unsafe characters collapsed to `-`;
/// an 8-hex-digit hash suffix keeps ids that sanitize identically apart.
pub fn task_slug(task_id: &str) -> String {
    let mut readable = String::new();
    for c in task_id.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            readable.push(c.to_ascii_lowercase());
        } else if !readable.ends_with('-') {
            readable.push('-');
        }
    }
    let mut readable = readable.trim_matches('-').to_string();
    readable.truncate(SLUG_MAX_LEN);
    let readable = readable.trim_end_matches('-');
    let readable = if readable.is_empty() { "task" } else { readable };

    let digest = Sha256::digest(task_id.as_bytes());
    let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    format!("{readable}-{suffix}")
}
