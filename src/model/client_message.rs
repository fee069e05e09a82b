use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::model::quiz::SubmittedAnswer;

/// Raw inbound frame: `{event, payload, requestId?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
}

/// `join_room` payload, tagged by role.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum JoinPayload {
    Student { nickname: String },
    Teacher { csrf: String },
}

/// Why the client wants the next question. Informational only; echoed back
/// on the matching `question_push`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Death,
    LevelUp,
    Retry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSubmitPayload {
    pub question_id: String,
    pub answer: SubmittedAnswer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestQuestionPayload {
    pub reason: TriggerReason,
}

/// A fully validated client event, produced at the parse boundary so the
/// room actor never touches raw JSON.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    JoinRoom(JoinPayload),
    StartQuiz,
    EndQuiz,
    AnswerSubmit(AnswerSubmitPayload),
    RequestQuestion(RequestQuestionPayload),
    RequestStats,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid payload for `{event}`: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientEvent {
    pub fn parse(envelope: &InboundEnvelope) -> Result<Self, ParseError> {
        let payload = envelope.payload.clone();
        let typed = |err| ParseError::InvalidPayload {
            event: envelope.event.clone(),
            source: err,
        };
        match envelope.event.as_str() {
            "join_room" => Ok(Self::JoinRoom(serde_json::from_value(payload).map_err(typed)?)),
            "start_quiz" => Ok(Self::StartQuiz),
            "end_quiz" => Ok(Self::EndQuiz),
            "answer_submit" => {
                Ok(Self::AnswerSubmit(serde_json::from_value(payload).map_err(typed)?))
            }
            "request_question" => {
                Ok(Self::RequestQuestion(serde_json::from_value(payload).map_err(typed)?))
            }
            "request_stats" => Ok(Self::RequestStats),
            other => Err(ParseError::UnknownEvent(other.to_string())),
        }
    }
}
