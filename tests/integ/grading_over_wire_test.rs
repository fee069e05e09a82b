use crate::{multi_choice, open_question, started_session, TestServer};

use backend::model::session::GameMode;
use serde_json::json;

/// Multi-choice grading over the wire: order-independent, duplicate-tolerant
/// set equality.
#[tokio::test]
async fn multi_choice_set_equality() {
    let server = TestServer::start().await;
    let meta = server
        .store
        .seed_session(
            vec![multi_choice(
                "q1",
                &[("o1", "a"), ("o2", "b"), ("o3", "c"), ("o4", "d")],
                &["o2", "o4"],
            )],
            GameMode::Classic,
        )
        .unwrap();
    let (_teacher, mut alice) = started_session(&server, &meta, "alice").await;

    // Reversed order is still correct.
    alice.request_question("death").await;
    let result = alice.submit_answer("q1", json!({"optionIds": ["o4", "o2"]})).await;
    assert_eq!(result.payload["correct"], true);

    // A correct question is never re-served; reseed with a fresh student to
    // cover the remaining cases.
    let mut bob = {
        let mut bob = crate::TestClient::connect(&server.ws_url(&meta.room_code)).await;
        bob.join_student("bob").await;
        bob.recv_until("start_quiz").await;
        bob
    };

    bob.request_question("death").await;
    let result = bob.submit_answer("q1", json!({"optionIds": ["o2"]})).await;
    assert_eq!(result.payload["correct"], false, "subset must be incorrect");

    bob.request_question("retry").await;
    let result = bob
        .submit_answer("q1", json!({"optionIds": ["o2", "o4", "o2"]}))
        .await;
    assert_eq!(result.payload["correct"], true, "duplicates are ignored");
}

#[tokio::test]
async fn open_answers_survive_whitespace_and_case() {
    let server = TestServer::start().await;
    let meta = server
        .store
        .seed_session(
            vec![open_question("q1", "Jupiter"), open_question("q2", "Mare Nostrum")],
            GameMode::Classic,
        )
        .unwrap();
    let (_teacher, mut alice) = started_session(&server, &meta, "alice").await;

    alice.request_question("death").await;
    let result = alice.submit_answer("q1", json!({"text": "  JUPITER! "})).await;
    assert_eq!(result.payload["correct"], true);

    alice.request_question("death").await;
    let result = alice.submit_answer("q2", json!({"text": "mare   nostrum"})).await;
    assert_eq!(result.payload["correct"], true);
}

/// A payload whose shape does not match the question type is a protocol
/// error, not a wrong answer: nothing is recorded and the reservation
/// survives for a corrected retry.
#[tokio::test]
async fn mismatched_answer_shape_is_rejected_without_consuming_the_attempt() {
    let server = TestServer::start().await;
    let meta = server
        .store
        .seed_session(vec![open_question("q1", "4")], GameMode::Classic)
        .unwrap();
    let (_teacher, mut alice) = started_session(&server, &meta, "alice").await;

    alice.request_question("death").await;
    let rejected = alice.submit_answer("q1", json!({"optionId": "o1"})).await;
    assert_eq!(rejected.event, "bad_request");
    assert_eq!(rejected.payload["code"], "BadRequest");
    assert!(server.store.answers_for(meta.id).is_empty());

    // Same reservation still answers.
    let result = alice.submit_answer("q1", json!({"text": "4"})).await;
    assert_eq!(result.event, "answer_result");
    assert_eq!(result.payload["correct"], true);
    let records = server.store.answers_for(meta.id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].attempt_no, 1);
}
