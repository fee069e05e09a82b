use std::time::Duration;

use crate::{started_session, TestClient, TestServer};

use backend::model::session::{GameMode, SessionStatus};
use serde_json::json;

#[tokio::test]
async fn start_broadcast_reaches_everyone_with_game_mode() {
    let server = TestServer::start().await;
    let meta = server.seed_two_question_session(GameMode::Platformer);

    let mut teacher = TestClient::connect(&server.ws_url(&meta.room_code)).await;
    teacher.join_teacher(&meta.csrf_token).await;
    let mut alice = TestClient::connect(&server.ws_url(&meta.room_code)).await;
    alice.join_student("alice").await;

    let started = teacher.start_quiz().await;
    assert_eq!(started.payload["gameMode"], "platformer");
    assert_eq!(started.payload["sessionId"], meta.id);

    let student_view = alice.recv_until("start_quiz").await;
    assert_eq!(student_view.payload["gameMode"], "platformer");
    assert_eq!(server.store.session_status(meta.id), Some(SessionStatus::Active));
}

#[tokio::test]
async fn quiz_cannot_start_twice_or_end_before_start() {
    let server = TestServer::start().await;
    let meta = server.seed_two_question_session(GameMode::Classic);

    let mut teacher = TestClient::connect(&server.ws_url(&meta.room_code)).await;
    teacher.join_teacher(&meta.csrf_token).await;

    teacher.send_event("end_quiz", json!({})).await;
    let rejected = teacher.recv_envelope().await;
    assert_eq!(rejected.event, "bad_request");

    teacher.start_quiz().await;
    teacher.send_event("start_quiz", json!({})).await;
    let rejected = teacher.recv_until("bad_request").await;
    assert_eq!(rejected.payload["code"], "BadRequest");
}

/// End of session: everyone gets `end_quiz`, late writes are refused with
/// `RoomClosed` and leave no trace in storage, and the sockets close.
#[tokio::test]
async fn finished_session_rejects_late_writes() {
    let server = TestServer::start().await;
    let meta = server.seed_two_question_session(GameMode::Classic);
    let (mut teacher, mut alice) = started_session(&server, &meta, "alice").await;

    alice.request_question("death").await;
    alice.submit_answer("q1", json!({"optionId": "o1"})).await;
    let records_before = server.store.answers_for(meta.id).len();

    teacher.send_event("end_quiz", json!({})).await;
    let ended = teacher.recv_until("end_quiz").await;
    assert_eq!(ended.payload["resultsReady"], true);
    let ended = alice.recv_until("end_quiz").await;
    assert_eq!(ended.payload["sessionId"], meta.id);

    // The socket is still open inside the drain window; the write must be
    // answered, not silently dropped.
    let rejected = alice.submit_answer("q2", json!({"optionId": "o2"})).await;
    assert_eq!(rejected.event, "bad_request");
    assert_eq!(rejected.payload["code"], "RoomClosed");
    assert_eq!(server.store.answers_for(meta.id).len(), records_before);
    assert_eq!(server.store.session_status(meta.id), Some(SessionStatus::Finished));

    // Then the server closes us.
    assert_eq!(alice.recv_close_reason().await, "");
}

#[tokio::test]
async fn finished_room_is_disposed_and_refuses_new_connections() {
    let server = TestServer::start().await;
    let meta = server.seed_two_question_session(GameMode::Classic);
    let (mut teacher, alice) = started_session(&server, &meta, "alice").await;
    assert_eq!(server.registry.live_rooms().await, 1);

    teacher.send_event("end_quiz", json!({})).await;
    teacher.recv_until("end_quiz").await;
    drop(teacher);
    drop(alice);

    // Past the drain cap: every socket is gone and the room deregistered.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(server.registry.live_rooms().await, 0);

    // A fresh connect re-materialises from storage, sees `finished`, and is
    // turned away with a terminal frame.
    let mut late = TestClient::connect(&server.ws_url(&meta.room_code)).await;
    let refusal = late.recv_envelope().await;
    assert_eq!(refusal.event, "bad_request");
    assert_eq!(refusal.payload["code"], "RoomClosed");
}

#[tokio::test]
async fn unknown_room_is_refused_with_room_not_found() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(&server.ws_url("ZZZZZZ")).await;
    let refusal = client.recv_envelope().await;
    assert_eq!(refusal.event, "bad_request");
    assert_eq!(refusal.payload["code"], "RoomNotFound");
}

#[tokio::test]
async fn waiting_room_update_tracks_leaves() {
    let server = TestServer::start().await;
    let meta = server.seed_two_question_session(GameMode::Classic);

    let mut teacher = TestClient::connect(&server.ws_url(&meta.room_code)).await;
    teacher.join_teacher(&meta.csrf_token).await;

    let mut alice = TestClient::connect(&server.ws_url(&meta.room_code)).await;
    alice.join_student("alice").await;
    drop(alice);

    // Grace (300 ms) passes; the coalesced update shows the leave.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let events = teacher.drain_events(Duration::from_millis(300)).await;
    let last_waiting = events
        .iter()
        .rev()
        .find(|e| e.event == "waiting_room_update")
        .expect("a waiting_room_update must follow the leave");
    assert_eq!(last_waiting.payload["participants"][0]["nickname"], "alice");
    assert_eq!(last_waiting.payload["participants"][0]["state"], "left");
}
