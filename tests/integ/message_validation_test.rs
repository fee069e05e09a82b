use crate::{started_session, TestClient, TestServer};

use backend::model::session::GameMode;
use serde_json::json;

#[tokio::test]
async fn invalid_json_gets_bad_request_without_disturbing_others() {
    let server = TestServer::start().await;
    let meta = server.seed_two_question_session(GameMode::Classic);
    let (_teacher, mut alice) = started_session(&server, &meta, "alice").await;

    let mut broken = TestClient::connect(&server.ws_url(&meta.room_code)).await;
    broken.send_raw_text("{this is not valid json}").await;
    let rejected = broken.recv_envelope().await;
    assert_eq!(rejected.event, "bad_request");
    assert!(rejected.payload["message"].as_str().unwrap().contains("envelope"));

    // A healthy client on the same room is unaffected.
    let push = alice.request_question("death").await;
    assert_eq!(push.event, "question_push");
}

#[tokio::test]
async fn unknown_event_names_are_rejected() {
    let server = TestServer::start().await;
    let meta = server.seed_two_question_session(GameMode::Classic);

    let mut client = TestClient::connect(&server.ws_url(&meta.room_code)).await;
    client.send_event("dance", json!({})).await;
    let rejected = client.recv_envelope().await;
    assert_eq!(rejected.event, "bad_request");
    assert!(rejected.payload["message"].as_str().unwrap().contains("dance"));
}

#[tokio::test]
async fn events_before_join_are_rejected() {
    let server = TestServer::start().await;
    let meta = server.seed_two_question_session(GameMode::Classic);

    let mut client = TestClient::connect(&server.ws_url(&meta.room_code)).await;
    client.send_event("request_question", json!({"reason": "death"})).await;
    let rejected = client.recv_envelope().await;
    assert_eq!(rejected.event, "bad_request");
    assert_eq!(rejected.payload["code"], "BadRequest");
}

#[tokio::test]
async fn role_mismatched_events_are_rejected() {
    let server = TestServer::start().await;
    let meta = server.seed_two_question_session(GameMode::Classic);
    let (mut teacher, mut alice) = started_session(&server, &meta, "alice").await;

    // Students cannot drive the session lifecycle.
    alice.send_event("end_quiz", json!({})).await;
    let rejected = alice.recv_envelope().await;
    assert_eq!(rejected.event, "bad_request");

    // Teachers do not answer questions.
    teacher
        .send_envelope(
            "answer_submit",
            json!({"questionId": "q1", "answer": {"optionId": "o1"}}),
            Some("t-1"),
        )
        .await;
    let rejected = teacher.recv_response("t-1").await;
    assert_eq!(rejected.event, "bad_request");
}

#[tokio::test]
async fn short_and_control_character_nicknames_are_rejected() {
    let server = TestServer::start().await;
    let meta = server.seed_two_question_session(GameMode::Classic);

    for nickname in ["a", "tab\tname", &"x".repeat(65)] {
        let mut client = TestClient::connect(&server.ws_url(&meta.room_code)).await;
        client
            .send_event("join_room", json!({"role": "student", "nickname": nickname}))
            .await;
        let rejected = client.recv_envelope().await;
        assert_eq!(rejected.event, "bad_request", "nickname {nickname:?}");
        assert_eq!(rejected.payload["code"], "BadRequest");
    }
}

#[tokio::test]
async fn double_join_on_one_connection_is_rejected() {
    let server = TestServer::start().await;
    let meta = server.seed_two_question_session(GameMode::Classic);

    let mut client = TestClient::connect(&server.ws_url(&meta.room_code)).await;
    client.join_student("alice").await;
    client
        .send_event("join_room", json!({"role": "student", "nickname": "alice2"}))
        .await;
    let rejected = client.recv_envelope().await;
    assert_eq!(rejected.event, "bad_request");
}

#[tokio::test]
async fn unknown_reason_values_are_rejected_at_the_boundary() {
    let server = TestServer::start().await;
    let meta = server.seed_two_question_session(GameMode::Classic);
    let (_teacher, mut alice) = started_session(&server, &meta, "alice").await;

    alice
        .send_event("request_question", json!({"reason": "rage_quit"}))
        .await;
    let rejected = alice.recv_envelope().await;
    assert_eq!(rejected.event, "bad_request");
    assert!(server.store.answers_for(meta.id).is_empty());
}
