use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    Open,
    Single,
    Multi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizOption {
    pub id: String,
    pub text: String,
}

/// The canonical correct answer, stored with the question and never sent to
/// clients. The three shapes are disjoint by field name, so the wire form is
/// untagged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerKey {
    Open {
        text: String,
    },
    Single {
        #[serde(rename = "optionId")]
        option_id: String,
    },
    Multi {
        #[serde(rename = "optionIds")]
        option_ids: Vec<String>,
    },
}

/// A student submission, same three shapes as [`AnswerKey`]. Parsed at the
/// envelope boundary so the grader only ever sees a well-formed variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmittedAnswer {
    Open {
        text: String,
    },
    Single {
        #[serde(rename = "optionId")]
        option_id: String,
    },
    Multi {
        #[serde(rename = "optionIds")]
        option_ids: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(rename = "type")]
    pub q_type: QuestionType,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<QuizOption>>,
    pub answer: AnswerKey,
}

/// Client-visible projection of a question: no answer key, options in stored
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionPublic {
    pub id: String,
    #[serde(rename = "type")]
    pub q_type: QuestionType,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<QuizOption>>,
}

impl Question {
    pub fn public_view(&self) -> QuestionPublic {
        QuestionPublic {
            id: self.id.clone(),
            q_type: self.q_type,
            prompt: self.prompt.clone(),
            options: self.options.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizIssue {
    pub field: String,
    pub issue: String,
}

impl QuizIssue {
    fn new(field: impl Into<String>, issue: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            issue: issue.into(),
        }
    }
}

/// Structural validation of quiz content before it backs a live session:
/// unique ids, non-empty prompts, and an answer key that matches the
/// question type.
pub fn validate_questions(questions: &[Question]) -> Result<(), Vec<QuizIssue>> {
    let mut issues = Vec::new();

    if questions.is_empty() {
        issues.push(QuizIssue::new("questions", "must contain at least one question"));
    }

    let mut seen_ids = HashSet::new();
    for (i, q) in questions.iter().enumerate() {
        let at = |suffix: &str| format!("questions[{i}].{suffix}");

        if q.id.trim().is_empty() {
            issues.push(QuizIssue::new(at("id"), "must not be empty"));
        }
        if !seen_ids.insert(q.id.as_str()) {
            issues.push(QuizIssue::new(at("id"), "must be unique"));
        }
        if q.prompt.trim().is_empty() {
            issues.push(QuizIssue::new(at("prompt"), "must not be empty"));
        }

        match q.q_type {
            QuestionType::Open => validate_open(q, &at, &mut issues),
            QuestionType::Single | QuestionType::Multi => validate_choice(q, &at, &mut issues),
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

fn validate_open(q: &Question, at: &dyn Fn(&str) -> String, issues: &mut Vec<QuizIssue>) {
    if q.options.is_some() {
        issues.push(QuizIssue::new(at("options"), "must be absent for open question"));
    }
    match &q.answer {
        AnswerKey::Open { text } if text.trim().is_empty() => {
            issues.push(QuizIssue::new(at("answer.text"), "must not be empty"));
        }
        AnswerKey::Open { .. } => {}
        _ => issues.push(QuizIssue::new(at("answer"), "must match open format")),
    }
}

fn validate_choice(q: &Question, at: &dyn Fn(&str) -> String, issues: &mut Vec<QuizIssue>) {
    let Some(options) = q.options.as_deref() else {
        issues.push(QuizIssue::new(at("options"), "is required for single/multi"));
        return;
    };
    if options.len() < 2 {
        issues.push(QuizIssue::new(at("options"), "must contain at least 2 options"));
    }

    let mut option_ids = HashSet::new();
    for (j, opt) in options.iter().enumerate() {
        if opt.id.trim().is_empty() || opt.text.trim().is_empty() {
            issues.push(QuizIssue::new(
                format!("{}[{j}]", at("options")),
                "id/text must not be empty",
            ));
        }
        if !option_ids.insert(opt.id.as_str()) {
            issues.push(QuizIssue::new(
                format!("{}[{j}].id", at("options")),
                "must be unique",
            ));
        }
    }

    match (q.q_type, &q.answer) {
        (QuestionType::Single, AnswerKey::Single { option_id }) => {
            if !option_ids.contains(option_id.as_str()) {
                issues.push(QuizIssue::new(
                    at("answer.optionId"),
                    "must reference an existing option id",
                ));
            }
        }
        (QuestionType::Multi, AnswerKey::Multi { option_ids: keys }) => {
            if keys.is_empty() {
                issues.push(QuizIssue::new(at("answer.optionIds"), "must not be empty"));
            }
            let mut seen = HashSet::new();
            for (k, id) in keys.iter().enumerate() {
                if !seen.insert(id.as_str()) {
                    issues.push(QuizIssue::new(
                        format!("{}[{k}]", at("answer.optionIds")),
                        "must be unique",
                    ));
                }
                if !option_ids.contains(id.as_str()) {
                    issues.push(QuizIssue::new(
                        format!("{}[{k}]", at("answer.optionIds")),
                        "must reference an existing option id",
                    ));
                }
            }
        }
        _ => issues.push(QuizIssue::new(at("answer"), "must match question type")),
    }
}
