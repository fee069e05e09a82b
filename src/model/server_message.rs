use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::client_message::TriggerReason;
use crate::model::quiz::QuestionPublic;
use crate::model::session::{GameMode, JoinState, SessionId};

/// Outbound frame: `{event, payload, requestId?, ts}` with `ts` in RFC 3339
/// at millisecond precision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEnvelope {
    pub event: String,
    pub payload: Value,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub ts: String,
}

/// Error taxonomy surfaced to clients, carried as the `code` field of
/// `bad_request` / `internal_error` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    NicknameTaken,
    NicknameInUse,
    RoomClosed,
    RoomNotFound,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingParticipant {
    pub nickname: String,
    pub state: JoinState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingRoomPayload {
    pub session_id: SessionId,
    pub participants: Vec<WaitingParticipant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartQuizPayload {
    pub session_id: SessionId,
    pub game_mode: GameMode,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionPushPayload {
    pub question: QuestionPublic,
    pub reason: TriggerReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NextAction {
    Retry,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerResultPayload {
    pub question_id: String,
    pub correct: bool,
    pub next_action: NextAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    pub correct_pct: f64,
    pub wrong_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStatsEntry {
    pub nickname: String,
    pub correct: u32,
    pub wrong: u32,
    pub correct_pct: f64,
    /// Distinct question ids this student has answered incorrectly.
    pub mistakes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsPayload {
    pub class: ClassStats,
    pub students: Vec<StudentStatsEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndQuizPayload {
    pub session_id: SessionId,
    pub ended_at: DateTime<Utc>,
    pub results_ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionExpiredPayload {
    pub question_id: String,
}

/// Every frame the server can emit. Conversion into a [`WsEnvelope`] stamps
/// the timestamp; the droppable flag drives the outbound overflow policy.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    WaitingRoomUpdate(WaitingRoomPayload),
    StartQuiz(StartQuizPayload),
    QuestionPush(QuestionPushPayload),
    AnswerResult(AnswerResultPayload),
    StatsUpdate(StatsPayload),
    EndQuiz(EndQuizPayload),
    NoMoreQuestions,
    QuestionExpired(QuestionExpiredPayload),
    BadRequest(ErrorPayload),
    InternalError(ErrorPayload),
}

impl ServerEvent {
    pub fn bad_request(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::BadRequest(ErrorPayload { code, message: message.into() })
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(ErrorPayload {
            code: ErrorCode::InternalError,
            message: message.into(),
        })
    }

    pub fn event(&self) -> &'static str {
        match self {
            Self::WaitingRoomUpdate(_) => "waiting_room_update",
            Self::StartQuiz(_) => "start_quiz",
            Self::QuestionPush(_) => "question_push",
            Self::AnswerResult(_) => "answer_result",
            Self::StatsUpdate(_) => "stats_update",
            Self::EndQuiz(_) => "end_quiz",
            Self::NoMoreQuestions => "no_more_questions",
            Self::QuestionExpired(_) => "question_expired",
            Self::BadRequest(_) => "bad_request",
            Self::InternalError(_) => "internal_error",
        }
    }

    /// Frames that may be evicted under backpressure. Everything else
    /// carries causal meaning to a specific client and must never be lost
    /// while the connection lives.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::WaitingRoomUpdate(_) | Self::StatsUpdate(_))
    }

    fn payload(&self) -> Value {
        fn to_value<T: Serialize>(payload: &T) -> Value {
            serde_json::to_value(payload)
                .expect("outbound payloads contain no non-serialisable values")
        }
        match self {
            Self::WaitingRoomUpdate(p) => to_value(p),
            Self::StartQuiz(p) => to_value(p),
            Self::QuestionPush(p) => to_value(p),
            Self::AnswerResult(p) => to_value(p),
            Self::StatsUpdate(p) => to_value(p),
            Self::EndQuiz(p) => to_value(p),
            Self::NoMoreQuestions => Value::Object(Default::default()),
            Self::QuestionExpired(p) => to_value(p),
            Self::BadRequest(p) | Self::InternalError(p) => to_value(p),
        }
    }

    pub fn into_envelope(self, request_id: Option<String>) -> WsEnvelope {
        WsEnvelope {
            event: self.event().to_string(),
            payload: self.payload(),
            request_id,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}
