//! The per-room state machine.
//!
//! One actor owns all mutable state for one session and drains a single
//! mailbox, so no lock guards room state and every client observes events in
//! the order the actor produced them. The actor never reads from a socket;
//! it only awaits its mailbox, store calls, and its own retry backoff.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{interval, sleep, Instant};

use crate::config::RoomConfig;
use crate::grader::{grade, Verdict};
use crate::model::client_message::{
    AnswerSubmitPayload, ClientEvent, JoinPayload, RequestQuestionPayload,
};
use crate::model::quiz::Question;
use crate::model::server_message::{
    AnswerResultPayload, ClassStats, EndQuizPayload, ErrorCode, NextAction, QuestionExpiredPayload,
    QuestionPushPayload, ServerEvent, StartQuizPayload, StatsPayload, StudentStatsEntry,
    WaitingParticipant, WaitingRoomPayload,
};
use crate::model::session::{
    correct_pct, nickname_is_valid, AggregateRow, AnswerRecord, JoinState, ParticipantId,
    ParticipantRow, QuestionStateRow, SessionMeta, SessionSnapshot, SessionStatus,
};
use crate::outbound::CloseReason;
use crate::registry::RoomRegistry;
use crate::room::messages::{ConnHandle, ConnId, RoomEvent};
use crate::store::{SessionStore, StoreError};

/// Outcome of a store call after the retry schedule is exhausted.
enum StoreFailure {
    Transient(String),
    Permanent(String),
    NicknameTaken,
}

async fn with_retry<'a, T, F>(config: &RoomConfig, mut op: F) -> Result<T, StoreFailure>
where
    F: FnMut() -> BoxFuture<'a, Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        let message = match tokio::time::timeout(config.store_deadline, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(StoreError::Permanent(msg))) => return Err(StoreFailure::Permanent(msg)),
            Ok(Err(StoreError::NicknameTaken)) => return Err(StoreFailure::NicknameTaken),
            Ok(Err(StoreError::Transient(msg))) => msg,
            Err(_) => "store deadline expired".to_string(),
        };
        if attempt >= config.retry_backoff.len() {
            return Err(StoreFailure::Transient(message));
        }
        warn!("store call failed ({message}), retry {} of {}", attempt + 1, config.retry_backoff.len());
        sleep(config.retry_backoff[attempt]).await;
        attempt += 1;
    }
}

struct QuestionState {
    attempts: u32,
    is_correct: bool,
    first_attempt_at: DateTime<Utc>,
    last_attempt_at: DateTime<Utc>,
}

struct Participant {
    row: ParticipantRow,
    conn: Option<ConnId>,
    disconnected_at: Option<Instant>,
    states: HashMap<String, QuestionState>,
    total_attempts: u32,
    /// Questions whose state is correct.
    correct: u32,
    /// Distinct question ids ever answered incorrectly, in first-mistake order.
    mistakes: Vec<String>,
}

/// One pending question per student; prevents double-dispatch.
struct Reservation {
    question_id: String,
    reserved_at: Instant,
}

/// State for one rate-limited broadcast kind (stats, waiting room).
#[derive(Default)]
struct Coalescer {
    window_open: bool,
    dirty: bool,
    timer: Option<AbortHandle>,
}

impl Coalescer {
    fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.window_open = false;
        self.dirty = false;
    }
}

enum ConnRole {
    Teacher,
    Student(ParticipantId),
}

struct ConnCtx {
    handle: ConnHandle,
    role: Option<ConnRole>,
}

pub struct RoomActor {
    registry: Arc<RoomRegistry>,
    store: Arc<dyn SessionStore>,
    config: RoomConfig,
    events_rx: mpsc::Receiver<RoomEvent>,
    self_tx: mpsc::Sender<RoomEvent>,

    session: SessionMeta,
    questions: Vec<Question>,
    question_index: HashMap<String, usize>,

    conns: HashMap<ConnId, ConnCtx>,
    teacher_conn: Option<ConnId>,
    teacher_gone_at: Option<Instant>,
    teacher_stall_logged: bool,

    participants: HashMap<ParticipantId, Participant>,
    nicknames: HashMap<String, ParticipantId>,
    reservations: HashMap<ParticipantId, Reservation>,

    stats: Coalescer,
    waiting: Coalescer,

    class_attempts: u32,
    class_correct: u32,

    /// Set once the session is finished; the actor lingers only to answer
    /// stragglers with `RoomClosed` until every connection is gone.
    finishing: bool,
}

impl RoomActor {
    pub fn spawn(
        registry: Arc<RoomRegistry>,
        store: Arc<dyn SessionStore>,
        config: RoomConfig,
        snapshot: SessionSnapshot,
    ) -> crate::registry::RoomHandle {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity);
        let actor = Self::from_snapshot(registry, store, config, snapshot, rx, tx.clone());
        tokio::spawn(actor.run());
        crate::registry::RoomHandle { events: tx }
    }

    fn from_snapshot(
        registry: Arc<RoomRegistry>,
        store: Arc<dyn SessionStore>,
        config: RoomConfig,
        snapshot: SessionSnapshot,
        events_rx: mpsc::Receiver<RoomEvent>,
        self_tx: mpsc::Sender<RoomEvent>,
    ) -> Self {
        let question_index = snapshot
            .questions
            .iter()
            .enumerate()
            .map(|(i, q)| (q.id.clone(), i))
            .collect();

        let mut actor = Self {
            registry,
            store,
            config,
            events_rx,
            self_tx,
            session: snapshot.session,
            questions: snapshot.questions,
            question_index,
            conns: HashMap::new(),
            teacher_conn: None,
            teacher_gone_at: None,
            teacher_stall_logged: false,
            participants: HashMap::new(),
            nicknames: HashMap::new(),
            reservations: HashMap::new(),
            stats: Coalescer::default(),
            waiting: Coalescer::default(),
            class_attempts: 0,
            class_correct: 0,
            finishing: false,
        };

        let now = Instant::now();
        for row in snapshot.participants {
            actor.nicknames.insert(row.nickname.clone(), row.id);
            let disconnected_at = (row.join_state != JoinState::Left).then_some(now);
            actor.participants.insert(
                row.id,
                Participant {
                    row,
                    conn: None,
                    // Everyone starts disconnected after a rehydrate; grant
                    // a fresh grace window before marking anyone as left.
                    disconnected_at,
                    states: HashMap::new(),
                    total_attempts: 0,
                    correct: 0,
                    mistakes: Vec::new(),
                },
            );
        }
        for state in snapshot.question_states {
            let Some(p) = actor.participants.get_mut(&state.participant_id) else {
                continue;
            };
            p.total_attempts += state.attempts;
            actor.class_attempts += state.attempts;
            if state.is_correct {
                p.correct += 1;
                actor.class_correct += 1;
            }
            if state.attempts > u32::from(state.is_correct) {
                p.mistakes.push(state.question_id.clone());
            }
            p.states.insert(
                state.question_id.clone(),
                QuestionState {
                    attempts: state.attempts,
                    is_correct: state.is_correct,
                    first_attempt_at: state.first_attempt_at,
                    last_attempt_at: state.last_attempt_at,
                },
            );
        }
        actor
    }

    async fn run(mut self) {
        info!("room {} actor started", self.session.room_code);
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let flow = tokio::select! {
                _ = sweep.tick() => self.sweep().await,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => ControlFlow::Break(()),
                },
            };
            if flow.is_break() {
                break;
            }
        }

        self.shutdown();
        self.registry.remove(&self.session.room_code).await;
        info!("room {} actor stopped", self.session.room_code);
    }

    fn shutdown(&mut self) {
        self.stats.cancel();
        self.waiting.cancel();
        for ctx in self.conns.values() {
            ctx.handle.queue.close_after_drain(CloseReason::Normal);
        }
        self.conns.clear();
    }

    async fn handle_event(&mut self, event: RoomEvent) -> ControlFlow<()> {
        match event {
            RoomEvent::Connected { conn } => {
                if self.finishing {
                    conn.send(
                        ServerEvent::bad_request(ErrorCode::RoomClosed, "session already finished"),
                        None,
                    );
                    conn.queue.close_after_drain(CloseReason::Normal);
                    return ControlFlow::Continue(());
                }
                self.conns.insert(conn.id, ConnCtx { handle: conn, role: None });
                ControlFlow::Continue(())
            }
            RoomEvent::Disconnected { conn_id } => {
                self.on_disconnected(conn_id);
                if self.finishing && self.conns.is_empty() {
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
            RoomEvent::Inbound { conn_id, event, request_id } => {
                if !self.conns.contains_key(&conn_id) {
                    // Raced with a disconnect; nothing to answer.
                    return ControlFlow::Continue(());
                }
                self.on_client_event(conn_id, event, request_id).await
            }
            RoomEvent::FlushStats => {
                self.stats.window_open = false;
                self.stats.timer = None;
                if self.stats.dirty {
                    self.stats.dirty = false;
                    self.send_stats_to_teacher(None);
                    self.open_stats_window();
                }
                ControlFlow::Continue(())
            }
            RoomEvent::FlushWaitingRoom => {
                self.waiting.window_open = false;
                self.waiting.timer = None;
                if self.waiting.dirty {
                    self.waiting.dirty = false;
                    self.send_waiting_to_teacher(None);
                    self.open_waiting_window();
                }
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_client_event(
        &mut self,
        conn_id: ConnId,
        event: ClientEvent,
        request_id: Option<String>,
    ) -> ControlFlow<()> {
        match event {
            ClientEvent::JoinRoom(payload) => self.on_join(conn_id, payload, request_id).await,
            ClientEvent::StartQuiz => self.on_start(conn_id, request_id).await,
            ClientEvent::EndQuiz => self.on_end(conn_id, request_id).await,
            ClientEvent::AnswerSubmit(payload) => {
                self.on_answer(conn_id, payload, request_id).await
            }
            ClientEvent::RequestQuestion(payload) => {
                self.on_request_question(conn_id, payload, request_id);
                ControlFlow::Continue(())
            }
            ClientEvent::RequestStats => {
                self.on_request_stats(conn_id, request_id);
                ControlFlow::Continue(())
            }
        }
    }

    // === join_room ===

    async fn on_join(
        &mut self,
        conn_id: ConnId,
        payload: JoinPayload,
        request_id: Option<String>,
    ) -> ControlFlow<()> {
        if self.finishing {
            self.reject(conn_id, ErrorCode::RoomClosed, "session already finished", request_id);
            return ControlFlow::Continue(());
        }
        if self.role_of(conn_id).is_some() {
            self.reject(conn_id, ErrorCode::BadRequest, "already joined", request_id);
            return ControlFlow::Continue(());
        }
        match payload {
            JoinPayload::Teacher { csrf } => self.join_teacher(conn_id, &csrf, request_id),
            JoinPayload::Student { nickname } => {
                self.join_student(conn_id, nickname.trim().to_string(), request_id).await
            }
        }
    }

    fn join_teacher(
        &mut self,
        conn_id: ConnId,
        csrf: &str,
        request_id: Option<String>,
    ) -> ControlFlow<()> {
        if csrf != self.session.csrf_token {
            self.reject(conn_id, ErrorCode::Unauthorized, "csrf token invalid", request_id);
            if let Some(ctx) = self.conns.get(&conn_id) {
                ctx.handle.queue.close_after_drain(CloseReason::Unauthorized);
            }
            return ControlFlow::Continue(());
        }

        // Second teacher tab wins; the previous connection is told why.
        if let Some(previous) = self.teacher_conn.take() {
            if let Some(ctx) = self.conns.get_mut(&previous) {
                info!("room {}: teacher superseded by a newer connection", self.session.room_code);
                ctx.role = None;
                ctx.handle.queue.close_after_drain(CloseReason::Superseded);
            }
        }

        self.teacher_conn = Some(conn_id);
        self.teacher_gone_at = None;
        self.teacher_stall_logged = false;
        if let Some(ctx) = self.conns.get_mut(&conn_id) {
            ctx.role = Some(ConnRole::Teacher);
        }

        self.send_to(conn_id, ServerEvent::WaitingRoomUpdate(self.waiting_payload()), request_id);
        self.catch_up_if_active(conn_id);
        ControlFlow::Continue(())
    }

    async fn join_student(
        &mut self,
        conn_id: ConnId,
        nickname: String,
        request_id: Option<String>,
    ) -> ControlFlow<()> {
        if !nickname_is_valid(&nickname) {
            self.reject(
                conn_id,
                ErrorCode::BadRequest,
                "nickname must be 2-64 characters without control characters",
                request_id,
            );
            return ControlFlow::Continue(());
        }

        let participant_id = if let Some(&existing) = self.nicknames.get(&nickname) {
            let live = self
                .participants
                .get(&existing)
                .is_some_and(|p| p.conn.is_some());
            if live {
                self.reject(
                    conn_id,
                    ErrorCode::NicknameInUse,
                    "nickname is bound to a live connection",
                    request_id,
                );
                return ControlFlow::Continue(());
            }
            let participant = self
                .participants
                .get_mut(&existing)
                .expect("nickname index points at a live participant");
            // Re-bind: same participant, timers reset, state revived.
            participant.conn = Some(conn_id);
            participant.disconnected_at = None;
            participant.row.left_at = None;
            participant.row.join_state = if self.session.status == SessionStatus::Active {
                JoinState::Playing
            } else {
                JoinState::Waiting
            };
            existing
        } else {
            let now = Utc::now();
            let store = &self.store;
            let session_id = self.session.id;
            let created = with_retry(&self.config, || {
                store.create_participant(session_id, &nickname, now)
            })
            .await;
            let id = match created {
                Ok(id) => id,
                Err(StoreFailure::NicknameTaken) => {
                    self.reject(conn_id, ErrorCode::NicknameTaken, "nickname already taken", request_id);
                    return ControlFlow::Continue(());
                }
                Err(StoreFailure::Transient(msg)) => {
                    self.fail_event(conn_id, &msg, request_id);
                    return ControlFlow::Continue(());
                }
                Err(StoreFailure::Permanent(msg)) => {
                    return self.crash(Some((conn_id, request_id)), &msg).await;
                }
            };
            let join_state = if self.session.status == SessionStatus::Active {
                JoinState::Playing
            } else {
                JoinState::Waiting
            };
            self.nicknames.insert(nickname.clone(), id);
            self.participants.insert(
                id,
                Participant {
                    row: ParticipantRow {
                        id,
                        nickname,
                        join_state,
                        connected_at: now,
                        left_at: None,
                    },
                    conn: Some(conn_id),
                    disconnected_at: None,
                    states: HashMap::new(),
                    total_attempts: 0,
                    correct: 0,
                    mistakes: Vec::new(),
                },
            );
            id
        };

        if let Some(ctx) = self.conns.get_mut(&conn_id) {
            ctx.role = Some(ConnRole::Student(participant_id));
        }

        self.send_to(conn_id, ServerEvent::WaitingRoomUpdate(self.waiting_payload()), request_id);
        self.catch_up_if_active(conn_id);
        self.mark_waiting_dirty();
        ControlFlow::Continue(())
    }

    /// A client joining an already-running session missed the original
    /// `start_quiz` broadcast; hand it the same frame directly.
    fn catch_up_if_active(&self, conn_id: ConnId) {
        if self.session.status == SessionStatus::Active {
            if let Some(started_at) = self.session.started_at {
                self.send_to(
                    conn_id,
                    ServerEvent::StartQuiz(StartQuizPayload {
                        session_id: self.session.id,
                        game_mode: self.session.game_mode,
                        started_at,
                    }),
                    None,
                );
            }
        }
    }

    // === start_quiz / end_quiz ===

    async fn on_start(&mut self, conn_id: ConnId, request_id: Option<String>) -> ControlFlow<()> {
        if !self.require_teacher(conn_id, &request_id) {
            return ControlFlow::Continue(());
        }
        if self.session.status != SessionStatus::Waiting {
            self.reject(conn_id, ErrorCode::BadRequest, "quiz already started", request_id);
            return ControlFlow::Continue(());
        }

        let started_at = Utc::now();
        let store = &self.store;
        let session_id = self.session.id;
        let persisted = with_retry(&self.config, || {
            store.set_session_status(session_id, SessionStatus::Active, Some(started_at), None)
        })
        .await;
        match persisted {
            Ok(()) => {}
            Err(StoreFailure::Transient(msg)) => {
                self.fail_event(conn_id, &msg, request_id);
                return ControlFlow::Continue(());
            }
            Err(StoreFailure::Permanent(msg)) => return self.crash(Some((conn_id, request_id)), &msg).await,
            Err(StoreFailure::NicknameTaken) => unreachable!("status update cannot hit a nickname constraint"),
        }

        self.session.status = SessionStatus::Active;
        self.session.started_at = Some(started_at);
        for participant in self.participants.values_mut() {
            if participant.row.join_state == JoinState::Waiting {
                participant.row.join_state = JoinState::Playing;
            }
        }
        info!("room {}: quiz started", self.session.room_code);

        self.broadcast(ServerEvent::StartQuiz(StartQuizPayload {
            session_id: self.session.id,
            game_mode: self.session.game_mode,
            started_at,
        }));
        self.mark_waiting_dirty();
        ControlFlow::Continue(())
    }

    async fn on_end(&mut self, conn_id: ConnId, request_id: Option<String>) -> ControlFlow<()> {
        if !self.require_teacher(conn_id, &request_id) {
            return ControlFlow::Continue(());
        }
        if self.session.status != SessionStatus::Active {
            self.reject(conn_id, ErrorCode::BadRequest, "quiz is not active", request_id);
            return ControlFlow::Continue(());
        }

        let ended_at = Utc::now();
        let store = &self.store;
        let session_id = self.session.id;
        let persisted = with_retry(&self.config, || {
            store.set_session_status(session_id, SessionStatus::Finished, None, Some(ended_at))
        })
        .await;
        match persisted {
            Ok(()) => {}
            Err(StoreFailure::Transient(msg)) => {
                self.fail_event(conn_id, &msg, request_id);
                return ControlFlow::Continue(());
            }
            Err(StoreFailure::Permanent(msg)) => return self.crash(Some((conn_id, request_id)), &msg).await,
            Err(StoreFailure::NicknameTaken) => unreachable!("status update cannot hit a nickname constraint"),
        }

        info!("room {}: quiz ended", self.session.room_code);
        self.finish(ended_at)
    }

    /// Common tail of the normal end and the crash path: broadcast
    /// `end_quiz`, hand every connection a drained close, and linger until
    /// the last socket is gone. Breaks the event loop right away if no
    /// socket is left to wait for.
    fn finish(&mut self, ended_at: DateTime<Utc>) -> ControlFlow<()> {
        self.session.status = SessionStatus::Finished;
        self.session.ended_at = Some(ended_at);
        self.finishing = true;
        self.stats.cancel();
        self.waiting.cancel();
        self.reservations.clear();

        self.broadcast(ServerEvent::EndQuiz(EndQuizPayload {
            session_id: self.session.id,
            ended_at,
            results_ready: true,
        }));
        for ctx in self.conns.values() {
            ctx.handle.queue.close_after_drain(CloseReason::Normal);
        }
        if self.conns.is_empty() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Permanent store failure: fail the originator (if any), persist the
    /// terminal status on a best-effort basis, and tear the room down.
    async fn crash(
        &mut self,
        originator: Option<(ConnId, Option<String>)>,
        message: &str,
    ) -> ControlFlow<()> {
        error!("room {}: permanent store failure: {message}", self.session.room_code);
        if let Some((conn_id, request_id)) = originator {
            self.send_to(conn_id, ServerEvent::internal_error("session storage failed"), request_id);
        }

        let ended_at = Utc::now();
        let terminal = tokio::time::timeout(
            self.config.store_deadline,
            self.store
                .set_session_status(self.session.id, SessionStatus::Finished, None, Some(ended_at)),
        )
        .await;
        if !matches!(terminal, Ok(Ok(()))) {
            warn!("room {}: could not persist crashed session status", self.session.room_code);
        }

        self.finish(ended_at)
    }

    // === request_question ===

    fn on_request_question(
        &mut self,
        conn_id: ConnId,
        payload: RequestQuestionPayload,
        request_id: Option<String>,
    ) {
        let Some(participant_id) = self.require_student(conn_id, &request_id) else {
            return;
        };
        match self.session.status {
            SessionStatus::Active => {}
            SessionStatus::Waiting => {
                self.reject(conn_id, ErrorCode::BadRequest, "quiz has not started", request_id);
                return;
            }
            SessionStatus::Finished => {
                self.reject(conn_id, ErrorCode::RoomClosed, "session already finished", request_id);
                return;
            }
        }
        if self.reservations.contains_key(&participant_id) {
            self.reject(
                conn_id,
                ErrorCode::BadRequest,
                "a question is already pending for this participant",
                request_id,
            );
            return;
        }

        self.touch_playing(participant_id);

        let participant = &self.participants[&participant_id];
        let next = self.questions.iter().find(|q| {
            participant
                .states
                .get(&q.id)
                .is_none_or(|state| !state.is_correct)
        });

        match next {
            Some(question) => {
                self.reservations.insert(
                    participant_id,
                    Reservation {
                        question_id: question.id.clone(),
                        reserved_at: Instant::now(),
                    },
                );
                self.send_to(
                    conn_id,
                    ServerEvent::QuestionPush(QuestionPushPayload {
                        question: question.public_view(),
                        reason: payload.reason,
                    }),
                    request_id,
                );
            }
            None => self.send_to(conn_id, ServerEvent::NoMoreQuestions, request_id),
        }
    }

    // === answer_submit ===

    async fn on_answer(
        &mut self,
        conn_id: ConnId,
        payload: AnswerSubmitPayload,
        request_id: Option<String>,
    ) -> ControlFlow<()> {
        let Some(participant_id) = self.require_student(conn_id, &request_id) else {
            return ControlFlow::Continue(());
        };
        if self.session.status == SessionStatus::Finished || self.finishing {
            self.reject(conn_id, ErrorCode::RoomClosed, "session already finished", request_id);
            return ControlFlow::Continue(());
        }

        let reserved = self
            .reservations
            .get(&participant_id)
            .filter(|r| r.question_id == payload.question_id);
        if reserved.is_none() {
            self.reject(
                conn_id,
                ErrorCode::BadRequest,
                "no pending question matches this submission",
                request_id,
            );
            return ControlFlow::Continue(());
        }

        let question = match self.question_index.get(&payload.question_id) {
            Some(&idx) => &self.questions[idx],
            None => {
                self.reject(conn_id, ErrorCode::BadRequest, "unknown question id", request_id);
                return ControlFlow::Continue(());
            }
        };

        let correct = match grade(question, &payload.answer) {
            Verdict::Correct => true,
            Verdict::Incorrect => false,
            Verdict::Malformed => {
                // The reservation survives so a corrected payload can retry.
                self.reject(
                    conn_id,
                    ErrorCode::BadRequest,
                    "answer shape does not match the question type",
                    request_id,
                );
                return ControlFlow::Continue(());
            }
        };

        // Compute the prospective rows, persist them, and only then commit
        // to memory, so a failed write leaves the room coherent for retries.
        let now = Utc::now();
        let participant = &self.participants[&participant_id];
        let prior = participant.states.get(&payload.question_id);
        let attempt_no = prior.map_or(0, |s| s.attempts) + 1;
        let first_attempt_at = prior.map_or(now, |s| s.first_attempt_at);

        let new_correct = participant.correct + u32::from(correct);
        let new_attempts = participant.total_attempts + 1;

        let record = AnswerRecord {
            session_id: self.session.id,
            participant_id,
            question_id: payload.question_id.clone(),
            attempt_no,
            payload: serde_json::to_value(&payload.answer)
                .expect("submitted answers contain no non-serialisable values"),
            correct,
            answered_at: now,
        };
        let state_row = QuestionStateRow {
            participant_id,
            question_id: payload.question_id.clone(),
            attempts: attempt_no,
            is_correct: correct || prior.is_some_and(|s| s.is_correct),
            first_attempt_at,
            last_attempt_at: now,
        };
        let participant_aggregate = AggregateRow {
            participant_id: Some(participant_id),
            correct: new_correct,
            wrong: new_attempts - new_correct,
            correct_pct: correct_pct(new_correct, new_attempts - new_correct),
            updated_at: now,
        };
        let class_correct = self.class_correct + u32::from(correct);
        let class_attempts = self.class_attempts + 1;
        let class_aggregate = AggregateRow {
            participant_id: None,
            correct: class_correct,
            wrong: class_attempts - class_correct,
            correct_pct: correct_pct(class_correct, class_attempts - class_correct),
            updated_at: now,
        };

        if let Err(failure) = self
            .persist_answer(record, state_row, participant_aggregate, class_aggregate)
            .await
        {
            return match failure {
                StoreFailure::Transient(msg) => {
                    self.fail_event(conn_id, &msg, request_id);
                    ControlFlow::Continue(())
                }
                StoreFailure::Permanent(msg) => self.crash(Some((conn_id, request_id)), &msg).await,
                StoreFailure::NicknameTaken => {
                    unreachable!("answer writes cannot hit a nickname constraint")
                }
            };
        }

        // Commit.
        let participant = self
            .participants
            .get_mut(&participant_id)
            .expect("participant present since role check");
        let state = participant
            .states
            .entry(payload.question_id.clone())
            .or_insert(QuestionState {
                attempts: 0,
                is_correct: false,
                first_attempt_at: now,
                last_attempt_at: now,
            });
        state.attempts = attempt_no;
        state.is_correct = state.is_correct || correct;
        state.last_attempt_at = now;
        participant.total_attempts = new_attempts;
        participant.correct = new_correct;
        if !correct && !participant.mistakes.contains(&payload.question_id) {
            participant.mistakes.push(payload.question_id.clone());
        }
        self.class_attempts += 1;
        if correct {
            self.class_correct += 1;
        }
        self.reservations.remove(&participant_id);
        self.touch_playing(participant_id);

        // answer_result strictly precedes the stats broadcast it causes.
        self.send_to(
            conn_id,
            ServerEvent::AnswerResult(AnswerResultPayload {
                question_id: payload.question_id,
                correct,
                next_action: if correct { NextAction::Continue } else { NextAction::Retry },
            }),
            request_id,
        );
        self.mark_stats_dirty();
        ControlFlow::Continue(())
    }

    async fn persist_answer(
        &self,
        record: AnswerRecord,
        state_row: QuestionStateRow,
        participant_aggregate: AggregateRow,
        class_aggregate: AggregateRow,
    ) -> Result<(), StoreFailure> {
        let store = &self.store;
        let session_id = self.session.id;
        with_retry(&self.config, || store.record_answer(record.clone())).await?;
        with_retry(&self.config, || {
            store.upsert_question_state(session_id, state_row.clone())
        })
        .await?;
        with_retry(&self.config, || {
            store.upsert_aggregate(session_id, participant_aggregate.clone())
        })
        .await?;
        with_retry(&self.config, || {
            store.upsert_aggregate(session_id, class_aggregate.clone())
        })
        .await
    }

    // === request_stats ===

    fn on_request_stats(&mut self, conn_id: ConnId, request_id: Option<String>) {
        if !self.require_teacher(conn_id, &request_id) {
            return;
        }
        self.send_to(conn_id, ServerEvent::StatsUpdate(self.stats_payload()), request_id);
    }

    // === disconnects and the sweep ===

    fn on_disconnected(&mut self, conn_id: ConnId) {
        let Some(ctx) = self.conns.remove(&conn_id) else {
            return;
        };
        match ctx.role {
            Some(ConnRole::Teacher) => {
                if self.teacher_conn == Some(conn_id) {
                    self.teacher_conn = None;
                    self.teacher_gone_at = Some(Instant::now());
                    self.teacher_stall_logged = false;
                    info!("room {}: teacher disconnected", self.session.room_code);
                }
            }
            Some(ConnRole::Student(participant_id)) => {
                if let Some(participant) = self.participants.get_mut(&participant_id) {
                    if participant.conn == Some(conn_id) {
                        participant.conn = None;
                        participant.disconnected_at = Some(Instant::now());
                    }
                }
            }
            None => {}
        }
    }

    async fn sweep(&mut self) -> ControlFlow<()> {
        if self.finishing {
            return ControlFlow::Continue(());
        }
        let now = Instant::now();

        // Students whose reconnect grace has lapsed are marked as left. A
        // transient write failure just leaves them for the next tick.
        let lapsed: Vec<ParticipantId> = self
            .participants
            .values()
            .filter(|p| {
                p.row.join_state != JoinState::Left
                    && p.conn.is_none()
                    && p.disconnected_at
                        .is_some_and(|at| now.duration_since(at) >= self.config.student_grace)
            })
            .map(|p| p.row.id)
            .collect();
        for participant_id in lapsed {
            let left_at = Utc::now();
            let store = &self.store;
            let persisted =
                with_retry(&self.config, || store.mark_participant_left(participant_id, left_at))
                    .await;
            match persisted {
                Ok(()) => {
                    if let Some(participant) = self.participants.get_mut(&participant_id) {
                        participant.row.join_state = JoinState::Left;
                        participant.row.left_at = Some(left_at);
                        info!(
                            "room {}: participant {} left after grace",
                            self.session.room_code, participant.row.nickname
                        );
                    }
                    self.mark_waiting_dirty();
                }
                Err(StoreFailure::Transient(msg)) => {
                    warn!("room {}: could not persist leave ({msg})", self.session.room_code);
                }
                Err(StoreFailure::Permanent(msg)) => {
                    return self.crash(None, &msg).await;
                }
                Err(StoreFailure::NicknameTaken) => {
                    unreachable!("leave writes cannot hit a nickname constraint")
                }
            }
        }

        // Reservations nobody answered.
        let expired: Vec<(ParticipantId, String)> = self
            .reservations
            .iter()
            .filter(|(_, r)| now.duration_since(r.reserved_at) >= self.config.reservation_ttl)
            .map(|(&pid, r)| (pid, r.question_id.clone()))
            .collect();
        for (participant_id, question_id) in expired {
            self.reservations.remove(&participant_id);
            if let Some(conn_id) = self.participants.get(&participant_id).and_then(|p| p.conn) {
                self.send_to(
                    conn_id,
                    ServerEvent::QuestionExpired(QuestionExpiredPayload { question_id }),
                    None,
                );
            }
        }

        // The session stays active without a teacher; just say so once.
        if !self.teacher_stall_logged {
            if let Some(gone_at) = self.teacher_gone_at {
                if now.duration_since(gone_at) >= self.config.teacher_grace {
                    warn!(
                        "room {}: teacher has not reconnected within {:?}; session stays active",
                        self.session.room_code, self.config.teacher_grace
                    );
                    self.teacher_stall_logged = true;
                }
            }
        }

        ControlFlow::Continue(())
    }

    // === coalesced broadcasts ===

    fn mark_stats_dirty(&mut self) {
        if self.stats.window_open {
            self.stats.dirty = true;
        } else {
            self.send_stats_to_teacher(None);
            self.open_stats_window();
        }
    }

    fn open_stats_window(&mut self) {
        self.stats.window_open = true;
        self.stats.timer = Some(self.schedule_flush(self.config.stats_window, RoomEvent::FlushStats));
    }

    fn mark_waiting_dirty(&mut self) {
        if self.waiting.window_open {
            self.waiting.dirty = true;
        } else {
            self.send_waiting_to_teacher(None);
            self.open_waiting_window();
        }
    }

    fn open_waiting_window(&mut self) {
        self.waiting.window_open = true;
        self.waiting.timer =
            Some(self.schedule_flush(self.config.waiting_room_window, RoomEvent::FlushWaitingRoom));
    }

    /// Single-shot timer that re-enters the mailbox, keeping every mutation
    /// on the actor's own event stream.
    fn schedule_flush(&self, after: Duration, event: RoomEvent) -> AbortHandle {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            sleep(after).await;
            let _ = tx.send(event).await;
        })
        .abort_handle()
    }

    fn send_stats_to_teacher(&self, request_id: Option<String>) {
        if let Some(conn_id) = self.teacher_conn {
            self.send_to(conn_id, ServerEvent::StatsUpdate(self.stats_payload()), request_id);
        }
    }

    fn send_waiting_to_teacher(&self, request_id: Option<String>) {
        if let Some(conn_id) = self.teacher_conn {
            self.send_to(conn_id, ServerEvent::WaitingRoomUpdate(self.waiting_payload()), request_id);
        }
    }

    // === payload builders ===

    fn waiting_payload(&self) -> WaitingRoomPayload {
        let mut participants: Vec<WaitingParticipant> = self
            .participants
            .values()
            .map(|p| WaitingParticipant {
                nickname: p.row.nickname.clone(),
                state: p.row.join_state,
            })
            .collect();
        participants.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        WaitingRoomPayload { session_id: self.session.id, participants }
    }

    fn stats_payload(&self) -> StatsPayload {
        let mut students: Vec<StudentStatsEntry> = self
            .participants
            .values()
            .map(|p| {
                let wrong = p.total_attempts - p.correct;
                StudentStatsEntry {
                    nickname: p.row.nickname.clone(),
                    correct: p.correct,
                    wrong,
                    correct_pct: correct_pct(p.correct, wrong),
                    mistakes: p.mistakes.clone(),
                }
            })
            .collect();
        students.sort_by(|a, b| a.nickname.cmp(&b.nickname));

        // Class figures are the sums of the per-student tallies, the same
        // attempt-based numbers the class aggregate row persists.
        let class_wrong = self.class_attempts - self.class_correct;
        StatsPayload {
            class: ClassStats {
                correct_pct: correct_pct(self.class_correct, class_wrong),
                wrong_pct: correct_pct(class_wrong, self.class_correct),
            },
            students,
        }
    }

    // === small helpers ===

    fn role_of(&self, conn_id: ConnId) -> Option<&ConnRole> {
        self.conns.get(&conn_id).and_then(|ctx| ctx.role.as_ref())
    }

    fn require_teacher(&self, conn_id: ConnId, request_id: &Option<String>) -> bool {
        match self.role_of(conn_id) {
            Some(ConnRole::Teacher) => true,
            _ => {
                self.reject(
                    conn_id,
                    ErrorCode::BadRequest,
                    "this event requires the teacher role",
                    request_id.clone(),
                );
                false
            }
        }
    }

    fn require_student(&self, conn_id: ConnId, request_id: &Option<String>) -> Option<ParticipantId> {
        match self.role_of(conn_id) {
            Some(ConnRole::Student(id)) => Some(*id),
            _ => {
                self.reject(
                    conn_id,
                    ErrorCode::BadRequest,
                    "this event requires a joined student",
                    request_id.clone(),
                );
                None
            }
        }
    }

    fn touch_playing(&mut self, participant_id: ParticipantId) {
        if let Some(participant) = self.participants.get_mut(&participant_id) {
            if participant.row.join_state == JoinState::Waiting {
                participant.row.join_state = JoinState::Playing;
                self.mark_waiting_dirty();
            }
        }
    }

    fn reject(
        &self,
        conn_id: ConnId,
        code: ErrorCode,
        message: &str,
        request_id: Option<String>,
    ) {
        self.send_to(conn_id, ServerEvent::bad_request(code, message), request_id);
    }

    fn fail_event(&self, conn_id: ConnId, message: &str, request_id: Option<String>) {
        warn!("room {}: store retries exhausted: {message}", self.session.room_code);
        self.send_to(
            conn_id,
            ServerEvent::internal_error("session storage is unavailable, please retry"),
            request_id,
        );
    }

    fn send_to(&self, conn_id: ConnId, event: ServerEvent, request_id: Option<String>) {
        if let Some(ctx) = self.conns.get(&conn_id) {
            ctx.handle.send(event, request_id);
        }
    }

    fn broadcast(&self, event: ServerEvent) {
        for ctx in self.conns.values() {
            ctx.handle.send(event.clone(), None);
        }
    }
}
