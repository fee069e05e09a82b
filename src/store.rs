//! The persistence gateway the room actor depends on.
//!
//! The production implementation wraps the SQL layer and lives with the
//! storage collaborator; [`MemoryStore`] is the in-process implementation
//! used in local mode and by the test harness. All writes arrive from a
//! room actor's serialized context, so implementations only need to tolerate
//! concurrency *between* rooms.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use thiserror::Error;

use crate::model::quiz::{validate_questions, Question, QuizIssue};
use crate::model::session::{
    AggregateRow, AnswerRecord, GameMode, ParticipantId, ParticipantRow, QuestionStateRow,
    SessionId, SessionMeta, SessionSnapshot, SessionStatus,
};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Worth retrying: deadline expiry, lost connection, lock contention.
    #[error("transient store error: {0}")]
    Transient(String),
    /// Not worth retrying: schema drift, constraint corruption. Ends the
    /// session.
    #[error("permanent store error: {0}")]
    Permanent(String),
    /// Unique-constraint failure on `(session, nickname)`.
    #[error("nickname already taken")]
    NicknameTaken,
}

pub trait SessionStore: Send + Sync {
    /// Load everything needed to materialise a room. `None` means no session
    /// carries this room code.
    fn load_session(
        &self,
        room_code: &str,
    ) -> BoxFuture<'_, Result<Option<SessionSnapshot>, StoreError>>;

    fn create_participant(
        &self,
        session_id: SessionId,
        nickname: &str,
        connected_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<ParticipantId, StoreError>>;

    /// Idempotent on `(session, participant, question, attempt_no)`.
    fn record_answer(&self, record: AnswerRecord) -> BoxFuture<'_, Result<(), StoreError>>;

    fn upsert_question_state(
        &self,
        session_id: SessionId,
        row: QuestionStateRow,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    fn upsert_aggregate(
        &self,
        session_id: SessionId,
        row: AggregateRow,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    fn set_session_status(
        &self,
        session_id: SessionId,
        status: SessionStatus,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    fn mark_participant_left(
        &self,
        participant_id: ParticipantId,
        left_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// Room codes: 6 characters over A–Z and 2–9, excluding the lookalikes
/// `0/O/1/I`.
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const ROOM_CODE_LEN: usize = 6;

pub fn mint_room_code() -> String {
    let mut rng = rand::rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.random_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

fn mint_token() -> String {
    let mut rng = rand::rng();
    (0..32)
        .map(|_| {
            let n = rng.random_range(0u8..36);
            char::from_digit(u32::from(n), 36).unwrap_or('0')
        })
        .collect()
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<SessionId, SessionMeta>,
    rooms: HashMap<String, SessionId>,
    quizzes: HashMap<i64, Vec<Question>>,
    participants: HashMap<ParticipantId, (SessionId, ParticipantRow)>,
    nicknames: HashMap<(SessionId, String), ParticipantId>,
    answers: HashMap<(SessionId, ParticipantId, String, u32), AnswerRecord>,
    question_states: HashMap<(SessionId, ParticipantId, String), QuestionStateRow>,
    aggregates: HashMap<(SessionId, Option<ParticipantId>), AggregateRow>,
    next_session_id: SessionId,
    next_quiz_id: i64,
    next_participant_id: ParticipantId,
    /// Errors handed out one per write call, front first. Test-only fault
    /// injection.
    planned_failures: VecDeque<StoreError>,
}

/// In-memory store: the whole state behind one mutex, never held across an
/// await.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `waiting` session over the given quiz, minting room code and
    /// tokens. This is the seeding surface the HTTP collaborator provides in
    /// production.
    pub fn seed_session(
        &self,
        questions: Vec<Question>,
        game_mode: GameMode,
    ) -> Result<SessionMeta, Vec<QuizIssue>> {
        validate_questions(&questions)?;
        let mut inner = self.lock();
        inner.next_session_id += 1;
        inner.next_quiz_id += 1;
        let session_id = inner.next_session_id;
        let quiz_id = inner.next_quiz_id;

        let mut room_code = mint_room_code();
        while inner.rooms.contains_key(&room_code) {
            room_code = mint_room_code();
        }

        let meta = SessionMeta {
            id: session_id,
            room_code: room_code.clone(),
            join_token: mint_token(),
            csrf_token: mint_token(),
            quiz_id,
            teacher_id: 1,
            game_mode,
            status: SessionStatus::Waiting,
            started_at: None,
            ended_at: None,
        };
        inner.quizzes.insert(quiz_id, questions);
        inner.rooms.insert(room_code, session_id);
        inner.sessions.insert(session_id, meta.clone());
        Ok(meta)
    }

    /// Queue errors to be returned by upcoming write calls, one per call.
    pub fn fail_next_writes(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.lock().planned_failures.extend(errors);
    }

    pub fn answers_for(&self, session_id: SessionId) -> Vec<AnswerRecord> {
        let inner = self.lock();
        let mut records: Vec<_> = inner
            .answers
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            (a.participant_id, &a.question_id, a.attempt_no)
                .cmp(&(b.participant_id, &b.question_id, b.attempt_no))
        });
        records
    }

    pub fn session_status(&self, session_id: SessionId) -> Option<SessionStatus> {
        self.lock().sessions.get(&session_id).map(|s| s.status)
    }

    pub fn participant_row(&self, participant_id: ParticipantId) -> Option<ParticipantRow> {
        self.lock()
            .participants
            .get(&participant_id)
            .map(|(_, row)| row.clone())
    }

    pub fn aggregate(
        &self,
        session_id: SessionId,
        participant_id: Option<ParticipantId>,
    ) -> Option<AggregateRow> {
        self.lock()
            .aggregates
            .get(&(session_id, participant_id))
            .cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("memory store mutex poisoned")
    }

    fn take_planned_failure(inner: &mut MemoryInner) -> Option<StoreError> {
        inner.planned_failures.pop_front()
    }
}

impl SessionStore for MemoryStore {
    fn load_session(
        &self,
        room_code: &str,
    ) -> BoxFuture<'_, Result<Option<SessionSnapshot>, StoreError>> {
        let room_code = room_code.to_string();
        Box::pin(async move {
            let inner = self.lock();
            let Some(&session_id) = inner.rooms.get(&room_code) else {
                return Ok(None);
            };
            let session = inner
                .sessions
                .get(&session_id)
                .cloned()
                .ok_or_else(|| StoreError::Permanent(format!("session {session_id} is gone")))?;
            let questions = inner
                .quizzes
                .get(&session.quiz_id)
                .cloned()
                .ok_or_else(|| StoreError::Permanent(format!("quiz {} is gone", session.quiz_id)))?;
            let participants = inner
                .participants
                .values()
                .filter(|(sid, _)| *sid == session_id)
                .map(|(_, row)| row.clone())
                .collect();
            let question_states = inner
                .question_states
                .iter()
                .filter(|((sid, _, _), _)| *sid == session_id)
                .map(|(_, row)| row.clone())
                .collect();
            let aggregates = inner
                .aggregates
                .iter()
                .filter(|((sid, _), _)| *sid == session_id)
                .map(|(_, row)| row.clone())
                .collect();
            Ok(Some(SessionSnapshot {
                session,
                questions,
                participants,
                question_states,
                aggregates,
            }))
        })
    }

    fn create_participant(
        &self,
        session_id: SessionId,
        nickname: &str,
        connected_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<ParticipantId, StoreError>> {
        let nickname = nickname.to_string();
        Box::pin(async move {
            let mut inner = self.lock();
            if let Some(err) = Self::take_planned_failure(&mut inner) {
                return Err(err);
            }
            let key = (session_id, nickname.clone());
            if inner.nicknames.contains_key(&key) {
                return Err(StoreError::NicknameTaken);
            }
            inner.next_participant_id += 1;
            let id = inner.next_participant_id;
            let row = ParticipantRow {
                id,
                nickname,
                join_state: crate::model::session::JoinState::Waiting,
                connected_at,
                left_at: None,
            };
            inner.nicknames.insert(key, id);
            inner.participants.insert(id, (session_id, row));
            Ok(id)
        })
    }

    fn record_answer(&self, record: AnswerRecord) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if let Some(err) = Self::take_planned_failure(&mut inner) {
                return Err(err);
            }
            let key = (
                record.session_id,
                record.participant_id,
                record.question_id.clone(),
                record.attempt_no,
            );
            // Re-recording the same attempt after a half-failed write is a
            // no-op.
            inner.answers.entry(key).or_insert(record);
            Ok(())
        })
    }

    fn upsert_question_state(
        &self,
        session_id: SessionId,
        row: QuestionStateRow,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if let Some(err) = Self::take_planned_failure(&mut inner) {
                return Err(err);
            }
            let key = (session_id, row.participant_id, row.question_id.clone());
            inner.question_states.insert(key, row);
            Ok(())
        })
    }

    fn upsert_aggregate(
        &self,
        session_id: SessionId,
        row: AggregateRow,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if let Some(err) = Self::take_planned_failure(&mut inner) {
                return Err(err);
            }
            inner.aggregates.insert((session_id, row.participant_id), row);
            Ok(())
        })
    }

    fn set_session_status(
        &self,
        session_id: SessionId,
        status: SessionStatus,
        started_at: Option<DateTime<Utc>>,
        ended_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if let Some(err) = Self::take_planned_failure(&mut inner) {
                return Err(err);
            }
            let session = inner
                .sessions
                .get_mut(&session_id)
                .ok_or_else(|| StoreError::Permanent(format!("session {session_id} is gone")))?;
            session.status = status;
            if started_at.is_some() {
                session.started_at = started_at;
            }
            if ended_at.is_some() {
                session.ended_at = ended_at;
            }
            Ok(())
        })
    }

    fn mark_participant_left(
        &self,
        participant_id: ParticipantId,
        left_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if let Some(err) = Self::take_planned_failure(&mut inner) {
                return Err(err);
            }
            let (_, row) = inner
                .participants
                .get_mut(&participant_id)
                .ok_or_else(|| StoreError::Permanent(format!("participant {participant_id} is gone")))?;
            row.join_state = crate::model::session::JoinState::Left;
            row.left_at = Some(left_at);
            Ok(())
        })
    }
}
