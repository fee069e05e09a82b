//! Shared harness for the WebSocket integration tests: a real server over a
//! seeded in-memory store, and a client speaking raw envelopes.

use std::sync::Arc;
use std::time::Duration;

use backend::config::RoomConfig;
use backend::model::quiz::{AnswerKey, Question, QuestionType, QuizOption};
use backend::model::server_message::WsEnvelope;
use backend::model::session::{GameMode, SessionMeta};
use backend::registry::RoomRegistry;
use backend::server::start_ws_server;
use backend::store::{MemoryStore, SessionStore};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};


const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Shrunk windows so grace and coalescing behaviour is observable in tests.
pub fn test_config() -> RoomConfig {
    RoomConfig {
        student_grace: Duration::from_millis(300),
        teacher_grace: Duration::from_millis(500),
        sweep_interval: Duration::from_millis(50),
        store_deadline: Duration::from_secs(2),
        retry_backoff: [
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40),
        ],
        drain_timeout: Duration::from_millis(400),
        ..RoomConfig::default()
    }
}

pub struct TestServer {
    pub ws_port: u16,
    pub store: Arc<MemoryStore>,
    pub registry: Arc<RoomRegistry>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with_config(test_config()).await
    }

    pub async fn start_with_config(config: RoomConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_port = listener.local_addr().unwrap().port();

        let store = Arc::new(MemoryStore::new());
        let store_for_registry: Arc<dyn SessionStore> = store.clone();
        let registry = RoomRegistry::new(store_for_registry, config);

        tokio::spawn(start_ws_server(listener, registry.clone()));

        // Give the server a moment to start
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self { ws_port, store, registry }
    }

    pub fn ws_url(&self, room_code: &str) -> String {
        format!("ws://127.0.0.1:{}/ws/sessions/{room_code}", self.ws_port)
    }

    /// Two single-choice questions: q1 (correct `o1`) and q2 (correct `o2`).
    pub fn seed_two_question_session(&self, mode: GameMode) -> SessionMeta {
        self.store
            .seed_session(
                vec![
                    single_choice("q1", &[("o1", "Paris"), ("o2", "Rome")], "o1"),
                    single_choice("q2", &[("o1", "Mars"), ("o2", "Venus")], "o2"),
                ],
                mode,
            )
            .unwrap()
    }
}

pub fn single_choice(id: &str, options: &[(&str, &str)], key: &str) -> Question {
    Question {
        id: id.into(),
        q_type: QuestionType::Single,
        prompt: format!("prompt for {id}"),
        options: Some(
            options
                .iter()
                .map(|(oid, text)| QuizOption { id: (*oid).into(), text: (*text).into() })
                .collect(),
        ),
        answer: AnswerKey::Single { option_id: key.into() },
    }
}

pub fn multi_choice(id: &str, options: &[(&str, &str)], keys: &[&str]) -> Question {
    Question {
        id: id.into(),
        q_type: QuestionType::Multi,
        prompt: format!("prompt for {id}"),
        options: Some(
            options
                .iter()
                .map(|(oid, text)| QuizOption { id: (*oid).into(), text: (*text).into() })
                .collect(),
        ),
        answer: AnswerKey::Multi { option_ids: keys.iter().map(|k| (*k).into()).collect() },
    }
}

pub fn open_question(id: &str, key: &str) -> Question {
    Question {
        id: id.into(),
        q_type: QuestionType::Open,
        prompt: format!("prompt for {id}"),
        options: None,
        answer: AnswerKey::Open { text: key.into() },
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestClient {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
}

impl TestClient {
    pub async fn connect(url: &str) -> Self {
        let (ws_stream, _) = connect_async(url).await.expect("Failed to connect");
        let (write, read) = ws_stream.split();
        Self { write, read }
    }

    pub async fn send_raw_text(&mut self, text: &str) {
        self.write
            .send(Message::Text(text.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn send_event(&mut self, event: &str, payload: Value) {
        self.send_envelope(event, payload, None).await;
    }

    pub async fn send_envelope(&mut self, event: &str, payload: Value, request_id: Option<&str>) {
        let mut envelope = json!({ "event": event, "payload": payload });
        if let Some(request_id) = request_id {
            envelope["requestId"] = json!(request_id);
        }
        self.send_raw_text(&envelope.to_string()).await;
    }

    /// Next text frame as an envelope; control frames are skipped.
    pub async fn recv_envelope(&mut self) -> WsEnvelope {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return serde_json::from_str(&text).unwrap();
                }
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
                Ok(Some(Ok(Message::Close(frame)))) => {
                    panic!("socket closed while waiting for an envelope: {frame:?}")
                }
                Ok(Some(Ok(other))) => panic!("unexpected frame: {other:?}"),
                Ok(Some(Err(e))) => panic!("WebSocket error: {e}"),
                Ok(None) => panic!("WebSocket stream ended"),
                Err(_) => panic!("timeout waiting for envelope (waited {RECV_TIMEOUT:?})"),
            }
        }
    }

    pub async fn expect_event(&mut self, event: &str) -> WsEnvelope {
        let envelope = self.recv_envelope().await;
        assert_eq!(envelope.event, event, "unexpected envelope: {envelope:?}");
        envelope
    }

    /// Skip envelopes until one with this event arrives. Useful when
    /// coalesced broadcasts interleave with direct responses.
    pub async fn recv_until(&mut self, event: &str) -> WsEnvelope {
        loop {
            let envelope = self.recv_envelope().await;
            if envelope.event == event {
                return envelope;
            }
        }
    }

    /// Skip envelopes until the response carrying this request id arrives.
    pub async fn recv_response(&mut self, request_id: &str) -> WsEnvelope {
        loop {
            let envelope = self.recv_envelope().await;
            if envelope.request_id.as_deref() == Some(request_id) {
                return envelope;
            }
        }
    }

    /// Collect every envelope that arrives within the window.
    pub async fn drain_events(&mut self, window: Duration) -> Vec<WsEnvelope> {
        let mut events = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return events;
            }
            match tokio::time::timeout(remaining, self.read.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    events.push(serde_json::from_str(&text).unwrap());
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return events,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => return events,
                Err(_) => return events,
            }
        }
    }

    /// Wait for the server to close the socket; returns the close reason.
    pub async fn recv_close_reason(&mut self) -> String {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.read.next()).await {
                Ok(Some(Ok(Message::Close(frame)))) => {
                    return frame.map(|f| f.reason.to_string()).unwrap_or_default();
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) | Ok(None) => return String::new(),
                Err(_) => panic!("timeout waiting for close (waited {RECV_TIMEOUT:?})"),
            }
        }
    }

    // === protocol shortcuts ===

    pub async fn join_student(&mut self, nickname: &str) -> WsEnvelope {
        self.send_event("join_room", json!({"role": "student", "nickname": nickname}))
            .await;
        self.expect_event("waiting_room_update").await
    }

    pub async fn join_teacher(&mut self, csrf: &str) -> WsEnvelope {
        self.send_event("join_room", json!({"role": "teacher", "csrf": csrf}))
            .await;
        self.expect_event("waiting_room_update").await
    }

    pub async fn start_quiz(&mut self) -> WsEnvelope {
        self.send_event("start_quiz", json!({})).await;
        self.recv_until("start_quiz").await
    }

    pub async fn request_question(&mut self, reason: &str) -> WsEnvelope {
        self.send_event("request_question", json!({"reason": reason})).await;
        self.recv_envelope().await
    }

    pub async fn submit_answer(&mut self, question_id: &str, answer: Value) -> WsEnvelope {
        self.send_event("answer_submit", json!({"questionId": question_id, "answer": answer}))
            .await;
        self.recv_envelope().await
    }

    pub async fn request_stats(&mut self, request_id: &str) -> WsEnvelope {
        self.send_envelope("request_stats", json!({}), Some(request_id)).await;
        self.recv_response(request_id).await
    }
}

/// Teacher + one started student, ready to exchange questions.
pub async fn started_session(
    server: &TestServer,
    meta: &SessionMeta,
    nickname: &str,
) -> (TestClient, TestClient) {
    let mut teacher = TestClient::connect(&server.ws_url(&meta.room_code)).await;
    teacher.join_teacher(&meta.csrf_token).await;

    let mut student = TestClient::connect(&server.ws_url(&meta.room_code)).await;
    student.join_student(nickname).await;

    teacher.start_quiz().await;
    student.recv_until("start_quiz").await;
    (teacher, student)
}
