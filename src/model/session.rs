use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::quiz::Question;

pub type SessionId = i64;
pub type ParticipantId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Active,
    Finished,
}

/// The core treats all game modes uniformly; `classic` merely means the
/// client runs no mini-game gate. `tycoon` is accepted as a plain alias of
/// the other game modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Platformer,
    Shooter,
    Tycoon,
    Classic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinState {
    Waiting,
    Playing,
    Left,
}

/// Session metadata as stored; immutable during a session apart from
/// `status` and the start/end stamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: SessionId,
    pub room_code: String,
    pub join_token: String,
    pub csrf_token: String,
    pub quiz_id: i64,
    pub teacher_id: i64,
    pub game_mode: GameMode,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRow {
    pub id: ParticipantId,
    pub nickname: String,
    pub join_state: JoinState,
    pub connected_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

/// Per participant × question progress. `is_correct` is sticky: once true it
/// never reverts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionStateRow {
    pub participant_id: ParticipantId,
    pub question_id: String,
    pub attempts: u32,
    pub is_correct: bool,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

/// Append-only record of one graded attempt. `attempt_no` is contiguous from
/// 1 per (participant, question).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub question_id: String,
    pub attempt_no: u32,
    pub payload: Value,
    pub correct: bool,
    pub answered_at: DateTime<Utc>,
}

/// Running tally row; `participant_id = None` is the class-wide row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRow {
    pub participant_id: Option<ParticipantId>,
    pub correct: u32,
    pub wrong: u32,
    pub correct_pct: f64,
    pub updated_at: DateTime<Utc>,
}

/// Everything the registry needs to materialise a live room: metadata, the
/// full quiz (answer keys included), and whatever state earlier connections
/// already persisted.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session: SessionMeta,
    pub questions: Vec<Question>,
    pub participants: Vec<ParticipantRow>,
    pub question_states: Vec<QuestionStateRow>,
    pub aggregates: Vec<AggregateRow>,
}

/// `correct / max(1, correct + wrong) × 100`, rounded to 2 decimals as it is
/// everywhere on the wire.
pub fn correct_pct(correct: u32, wrong: u32) -> f64 {
    let total = (correct + wrong).max(1);
    round2(f64::from(correct) * 100.0 / f64::from(total))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Nicknames are 2–64 characters with no control characters.
pub fn nickname_is_valid(nickname: &str) -> bool {
    let len = nickname.chars().count();
    (2..=64).contains(&len) && !nickname.chars().any(char::is_control)
}
