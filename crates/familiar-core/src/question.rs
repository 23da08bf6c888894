//! Question detection in agent output.
//!
//! Patterns are tried in priority order and the first match wins:
//! confirmation > choice > permission > blocked > input > clarification (trailing `?`).

use regex::Regex;

use crate::types::QuestionType;

/// A question found in a single output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub question_type: QuestionType,
    pub text: String,
    pub options: Option<Vec<String>>,
}

/// Ordered set of compiled question patterns.
#[derive(Debug, Clone)]
pub struct QuestionDetector {
    confirmation: Regex,
    bracket_choice: Regex,
    paren_choice: Regex,
    permission: Regex,
    blocked: Regex,
    input: Regex,
    trailing_question: Regex,
    code_like: Regex,
}

impl Default for QuestionDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Longest line the detector considers. Longer lines are treated as prose or data.
const MAX_QUESTION_LEN: usize = 500;

impl QuestionDetector {
    pub fn new() -> Self {
        // Patterns are literals; a failure here is a programming error caught by tests.
        let re = |p: &str| Regex::new(p).unwrap_or_else(|e| panic!("bad pattern {p}: {e}"));
        Self {
            confirmation: re(r"(?i)[\(\[]\s*(y(?:es)?)\s*/\s*(n(?:o)?)\s*[\)\]]"),
            bracket_choice: re(r"\[([^\[\]/]+(?:/[^\[\]/]+)+)\]"),
            paren_choice: re(r"\(([^(),]+(?:,[^(),]+)+)\)\s*[?:]?\s*$"),
            permission: re(
                r"(?i)\b(may i|can i|shall i|should i|do you want me to|would you like me to|is it ok(?:ay)? (?:if|to)|do i have permission|allow me to)\b.*\?\s*$",
            ),
            blocked: re(
                r"(?i)\b(i am blocked|i'm blocked|i am stuck|i'm stuck|cannot proceed|can't proceed|unable to proceed|need (?:your|human) (?:input|help|guidance))\b",
            ),
            input: re(r"(?i)^\s*(?:please\s+)?(?:enter|provide|type|paste|specify)\b.*:\s*$"),
            trailing_question: re(r"\?\s*$"),
            code_like: re(r"^\s*(?://|#|\*|/\*|[{}\[\]<>])|[;{}]\s*$|\?\s*[;)]"),
        }
    }

    /// Classify one line of stdout. Returns `None` when the line is not a question.
    pub fn detect(&self, line: &str) -> Option<Detection> {
        let text = line.trim();
        if text.is_empty() || text.len() > MAX_QUESTION_LEN {
            return None;
        }

        if let Some(caps) = self.confirmation.captures(text) {
            return Some(Detection {
                question_type: QuestionType::Confirmation,
                text: text.to_string(),
                options: Some(vec![caps[1].to_string(), caps[2].to_string()]),
            });
        }

        let interrogative = text.contains('?') || text.ends_with(':');

        if let Some(caps) = self.bracket_choice.captures(text).filter(|_| interrogative) {
            return Some(Detection {
                question_type: QuestionType::Choice,
                text: text.to_string(),
                options: Some(split_options(&caps[1], '/')),
            });
        }

        if let Some(caps) = self.paren_choice.captures(text).filter(|_| interrogative) {
            return Some(Detection {
                question_type: QuestionType::Choice,
                text: text.to_string(),
                options: Some(split_options(&caps[1], ',')),
            });
        }

        if self.permission.is_match(text) {
            return Some(self.plain(QuestionType::Permission, text));
        }

        if self.blocked.is_match(text) {
            return Some(self.plain(QuestionType::Blocked, text));
        }

        if self.input.is_match(text) {
            return Some(self.plain(QuestionType::Input, text));
        }

        if self.trailing_question.is_match(text)
            && !self.code_like.is_match(text)
            && text.split_whitespace().count() >= 3
        {
            return Some(self.plain(QuestionType::Clarification, text));
        }

        None
    }

    fn plain(&self, question_type: QuestionType, text: &str) -> Detection {
        Detection {
            question_type,
            text: text.to_string(),
            options: None,
        }
    }
}

fn split_options(list: &str, sep: char) -> Vec<String> {
    list.split(sep)
        .map(|s| s.trim().trim_end_matches('?').trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(line: &str) -> Option<Detection> {
        QuestionDetector::new().detect(line)
    }

    #[test]
    fn yes_no_is_confirmation_with_options() {
        let d = detect("Continue with changes? (y/n)").unwrap();
        assert_eq!(d.question_type, QuestionType::Confirmation);
        assert_eq!(d.options, Some(vec!["y".to_string(), "n".to_string()]));

        let d = detect("Overwrite existing file [Y/n]").unwrap();
        assert_eq!(d.question_type, QuestionType::Confirmation);
        assert_eq!(d.options, Some(vec!["Y".to_string(), "n".to_string()]));

        let d = detect("Proceed? (yes/no)").unwrap();
        assert_eq!(d.options, Some(vec!["yes".to_string(), "no".to_string()]));
    }

    #[test]
    fn confirmation_beats_permission() {
        let d = detect("Should I delete the old module? (y/n)").unwrap();
        assert_eq!(d.question_type, QuestionType::Confirmation);
    }

    #[test]
    fn bracketed_list_is_choice() {
        let d = detect("Which database should I use? [sqlite/postgres/mysql]").unwrap();
        assert_eq!(d.question_type, QuestionType::Choice);
        assert_eq!(
            d.options,
            Some(vec![
                "sqlite".to_string(),
                "postgres".to_string(),
                "mysql".to_string()
            ])
        );
    }

    #[test]
    fn parenthesized_list_is_choice() {
        let d = detect("Pick a strategy (merge, squash, rebase)?").unwrap();
        assert_eq!(d.question_type, QuestionType::Choice);
        assert_eq!(
            d.options,
            Some(vec![
                "merge".to_string(),
                "squash".to_string(),
                "rebase".to_string()
            ])
        );
    }

    #[test]
    fn permission_phrasing() {
        let d = detect("May I run the database migration now?").unwrap();
        assert_eq!(d.question_type, QuestionType::Permission);
        assert!(d.options.is_none());
        let d = detect("Do you want me to also update the docs?").unwrap();
        assert_eq!(d.question_type, QuestionType::Permission);
    }

    #[test]
    fn blocked_and_input_phrasing() {
        let d = detect("I'm blocked: the API credentials are missing.").unwrap();
        assert_eq!(d.question_type, QuestionType::Blocked);
        let d = detect("Please provide the staging hostname:").unwrap();
        assert_eq!(d.question_type, QuestionType::Input);
    }

    #[test]
    fn trailing_question_mark_is_clarification() {
        let d = detect("What should the default timeout be?").unwrap();
        assert_eq!(d.question_type, QuestionType::Clarification);
    }

    #[test]
    fn ignores_non_questions() {
        for line in [
            "",
            "Running tests...",
            "let x = maybe()?;",
            "// is this right?",
            "why?",
            "value.map(|v| v.parse::<u32>())?",
            "Modified 2 files (src/a.rs, src/b.rs)",
            "[INFO/main] starting",
        ] {
            assert!(detect(line).is_none(), "unexpected question in '{line}'");
        }
    }

    #[test]
    fn overly_long_lines_are_ignored() {
        let line = format!("{}?", "word ".repeat(200));
        assert!(detect(&line).is_none());
    }
}
