//! Completion detection and result extraction for agent output.
//!
//! An agent signals completion by printing `<promise>COMPLETE</promise>` on a line of
//! its own. Changed files and a free-text summary are extracted best-effort from the
//! same output.

use std::sync::LazyLock;

use regex::Regex;

/// The completion token that signals task completion.
pub const COMPLETION_TOKEN: &str = "<promise>COMPLETE</promise>";

/// Summaries longer than this are truncated.
const MAX_SUMMARY_CHARS: usize = 500;

/// Result of completion detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    /// Whether some line of the output is exactly the token after trimming.
    pub is_complete: bool,
    /// Whether the token was found anywhere in the output (for malformed detection).
    pub token_found: bool,
    /// Whether the token was malformed (found but not accepted).
    pub is_malformed: bool,
}

/// Check whether the output signals completion.
///
/// # Example
/// ```
/// use familiar_core::completion::check_completion;
///
/// let result = check_completion("Done.\n<promise>COMPLETE</promise>\n");
/// assert!(result.is_complete);
///
/// let result = check_completion("Almost <promise>COMPLETE</promise> done.");
/// assert!(!result.is_complete);
/// assert!(result.is_malformed);
/// ```
pub fn check_completion(output: &str) -> CompletionResult {
    let token_found = output.contains(COMPLETION_TOKEN);
    let is_complete = token_found && output.lines().any(is_completion_line);

    CompletionResult {
        is_complete,
        token_found,
        is_malformed: token_found && !is_complete,
    }
}

/// Whether a single line is the bare completion token.
pub fn is_completion_line(line: &str) -> bool {
    line.trim() == COMPLETION_TOKEN
}

static FILE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:[-*]\s+)?(?:modified|created|updated|edited|wrote|deleted|changed)(?:\s+file)?:?\s+`?([\w./-]*\w\.\w+|[\w./-]+/[\w.-]+)`?",
    )
    .unwrap_or_else(|e| panic!("bad file pattern: {e}"))
});

static FILES_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#+\s*)?files?\s+(?:changed|modified)\s*:?\s*$")
        .unwrap_or_else(|e| panic!("bad header pattern: {e}"))
});

static BULLET_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]\s+`?([\w./-]+)`?").unwrap_or_else(|e| panic!("bad bullet pattern: {e}"))
});

static SUMMARY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#+\s*)?\**summary\b\**\s*:?\s*(.*)$")
        .unwrap_or_else(|e| panic!("bad summary pattern: {e}"))
});

/// Paths the agent reports as changed, in first-seen order without duplicates.
pub fn extract_files_changed(output: &str) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    let mut push = |path: &str| {
        let path = path.trim_end_matches(['.', ',', ':']);
        if !path.is_empty() && !files.iter().any(|f| f == path) {
            files.push(path.to_string());
        }
    };

    let mut in_list = false;
    for line in output.lines() {
        if FILES_HEADER.is_match(line) {
            in_list = true;
            continue;
        }
        if in_list {
            if let Some(caps) = BULLET_PATH.captures(line) {
                push(&caps[1]);
                continue;
            }
            in_list = false;
        }
        if let Some(caps) = FILE_LINE.captures(line) {
            push(&caps[1]);
        }
    }
    files
}

/// Free-text summary: the paragraph after a `Summary:` heading, or else the last
/// meaningful line before the completion token.
pub fn extract_summary(output: &str) -> String {
    let lines: Vec<&str> = output.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        let Some(caps) = SUMMARY_LINE.captures(line) else {
            continue;
        };
        let inline = caps[1].trim();
        if !inline.is_empty() {
            return truncate(inline);
        }
        let paragraph: Vec<&str> = lines[i + 1..]
            .iter()
            .map(|l| l.trim())
            .skip_while(|l| l.is_empty())
            .take_while(|l| !l.is_empty() && !is_completion_line(l))
            .collect();
        if !paragraph.is_empty() {
            return truncate(&paragraph.join(" "));
        }
    }

    lines
        .iter()
        .rev()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && !l.contains(COMPLETION_TOKEN))
        .map(truncate)
        .unwrap_or_default()
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_SUMMARY_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
