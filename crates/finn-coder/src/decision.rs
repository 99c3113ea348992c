//! Textual decision detection.
//!
//! The coder sometimes asks the user to choose between approaches in plain
//! prose instead of invoking its structured question tool. This parser is
//! the safety net for that case: it accumulates assistant text and looks
//! for a question sentence followed by a numbered option list. Heuristic on
//! purpose; the structured tools remain the preferred path.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// A choice the coder is asking the user to make.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub question: String,
    pub context: String,
    pub options: Vec<DecisionOption>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionOption {
    pub id: String,
    pub label: String,
    pub description: String,
}

const MAX_OPTIONS: usize = 4;

fn question_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(Which|What|How|Should I|Do you want|Would you like).*\?").expect("regex")
    })
}

fn option_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // "1. Label - optional description"
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(\d+)\.\s+(.+?)(?:\s+-\s+(.+))?$").expect("regex"))
}

#[derive(Debug, Default)]
pub struct DecisionParser {
    buffer: String,
}

impl DecisionParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_content(&mut self, content: &str) {
        self.buffer.push_str(content);
        self.buffer.push('\n');
    }

    /// Returns a decision when the buffer holds a question plus at least
    /// two numbered options; at most four options survive.
    pub fn extract_decision(&self) -> Option<Decision> {
        let text = &self.buffer;

        let question_match = question_regex().find(text)?;
        let question = question_match.as_str().to_string();

        let mut options = Vec::new();
        for captures in option_regex().captures_iter(text) {
            let id = captures.get(1)?.as_str().to_string();
            let label = captures.get(2)?.as_str().trim().to_string();
            let description = captures
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            options.push(DecisionOption {
                id,
                label,
                description,
            });
            if options.len() == MAX_OPTIONS {
                break;
            }
        }
        if options.len() < 2 {
            return None;
        }

        let context = text[..question_match.start()].trim().to_string();

        Some(Decision {
            question,
            context,
            options,
        })
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_question_with_numbered_options() {
        let mut parser = DecisionParser::new();
        parser.add_content("I can see a few ways to add dark mode.");
        parser.add_content("Which approach should I use?");
        parser.add_content("1. Tailwind variants - built-in dark mode classes");
        parser.add_content("2. CSS variables - custom properties with a toggle");
        parser.add_content("3. styled-components - ThemeProvider approach");

        let decision = parser.extract_decision().expect("decision");
        assert_eq!(decision.question, "Which approach should I use?");
        assert_eq!(decision.options.len(), 3);
        assert_eq!(decision.options[0].id, "1");
        assert_eq!(decision.options[0].label, "Tailwind variants");
        assert_eq!(decision.options[0].description, "built-in dark mode classes");
        assert!(decision.context.contains("dark mode"));
    }

    #[test]
    fn requires_at_least_two_options() {
        let mut parser = DecisionParser::new();
        parser.add_content("Should I continue?");
        parser.add_content("1. Yes - go ahead");
        assert!(parser.extract_decision().is_none());
    }

    #[test]
    fn plain_prose_with_question_mark_is_not_a_decision() {
        let mut parser = DecisionParser::new();
        parser.add_content("The build passes now. Neat, right?");
        parser.add_content("Next I'll wire up the tests.");
        assert!(parser.extract_decision().is_none());
    }

    #[test]
    fn question_verb_outside_allowed_set_is_missed() {
        // Known limitation of the heuristic: only the fixed verb set opens
        // a question.
        let mut parser = DecisionParser::new();
        parser.add_content("Can you pick one?");
        parser.add_content("1. First - a");
        parser.add_content("2. Second - b");
        assert!(parser.extract_decision().is_none());
    }

    #[test]
    fn options_cap_at_four() {
        let mut parser = DecisionParser::new();
        parser.add_content("What color scheme do you want?");
        for i in 1..=6 {
            parser.add_content(&format!("{i}. Option {i} - description {i}"));
        }
        let decision = parser.extract_decision().expect("decision");
        assert_eq!(decision.options.len(), 4);
    }

    #[test]
    fn reset_clears_accumulated_text() {
        let mut parser = DecisionParser::new();
        parser.add_content("Which one?");
        parser.add_content("1. A - x");
        parser.add_content("2. B - y");
        assert!(parser.extract_decision().is_some());

        parser.reset();
        assert!(parser.extract_decision().is_none());
    }

    #[test]
    fn option_without_description_keeps_empty_field() {
        let mut parser = DecisionParser::new();
        parser.add_content("Do you want a router?");
        parser.add_content("1. React Router");
        parser.add_content("2. TanStack Router");
        let decision = parser.extract_decision().expect("decision");
        assert_eq!(decision.options[0].label, "React Router");
        assert!(decision.options[0].description.is_empty());
    }
}
