//! Pure answer grading. No I/O, no clock, no state.

use std::collections::HashSet;

use crate::model::quiz::{AnswerKey, Question, SubmittedAnswer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Correct,
    Incorrect,
    /// The payload shape does not match the question's type (e.g. an
    /// `optionId` sent for an open question). Distinct from a wrong answer.
    Malformed,
}

/// Characters stripped from both sides of an open-answer comparison.
const STRIPPED_PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':', '"', '\''];

pub fn grade(question: &Question, submitted: &SubmittedAnswer) -> Verdict {
    match (&question.answer, submitted) {
        (AnswerKey::Open { text: key }, SubmittedAnswer::Open { text }) => {
            verdict(normalize(key) == normalize(text))
        }
        (AnswerKey::Single { option_id: key }, SubmittedAnswer::Single { option_id }) => {
            // An unknown option id is simply a wrong answer.
            verdict(key == option_id)
        }
        (AnswerKey::Multi { option_ids: keys }, SubmittedAnswer::Multi { option_ids }) => {
            if option_ids.is_empty() {
                return Verdict::Incorrect;
            }
            let expected: HashSet<&str> = keys.iter().map(String::as_str).collect();
            let actual: HashSet<&str> = option_ids.iter().map(String::as_str).collect();
            verdict(expected == actual)
        }
        _ => Verdict::Malformed,
    }
}

fn verdict(correct: bool) -> Verdict {
    if correct {
        Verdict::Correct
    } else {
        Verdict::Incorrect
    }
}

/// Trim, collapse internal whitespace, lowercase (Unicode-aware), and strip
/// the fixed punctuation set.
fn normalize(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| !STRIPPED_PUNCTUATION.contains(c))
        .collect();
    stripped
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
