use application::{ChatHistory, HistoryError};
use domain::{ConversationKey, Identity, IdentityId, Message, MessageBody};
use infrastructure::HttpChatHistory;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn id(value: &str) -> IdentityId {
    IdentityId::parse(value).unwrap()
}

#[tokio::test]
async fn fetch_public_history_accepts_legacy_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "_id": "m1",
                "user": {"_id": "u1", "username": "ann"},
                "text": "first",
                "createdAt": "2024-05-01T10:00:00.000Z"
            },
            {
                "_id": "m2",
                "user": {"_id": "u2", "username": "bob"},
                "text": "second",
                "createdAt": "2024-05-01T10:01:00.000Z"
            }
        ])))
        .mount(&server)
        .await;

    let history = HttpChatHistory::new(server.uri());
    let messages = history.fetch_history(None).await.unwrap();

    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id.as_ref().unwrap().as_str(), "m1");
    assert_eq!(messages[0].sender.display_name(), "ann");
    assert_eq!(messages[1].body.as_str(), "second");
    assert!(messages.iter().all(|m| !m.is_private()));
}

#[tokio::test]
async fn fetch_private_history_uses_conversation_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/privateMessages/private/ann/bob"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [{
                "_id": "p1",
                "sender": {"_id": "bob", "username": "Bob"},
                "receiver": {"_id": "ann", "username": "Ann"},
                "content": "psst",
                "createdAt": "2024-05-01T10:00:00.000Z"
            }],
            "count": 1
        })))
        .mount(&server)
        .await;

    let history = HttpChatHistory::new(format!("{}/", server.uri()));
    let key = ConversationKey::between(&id("bob"), &id("ann"));
    let messages = history.fetch_history(Some(key.clone())).await.unwrap();

    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_private());
    assert_eq!(messages[0].conversation_key(), Some(key));
}

#[tokio::test]
async fn fetch_identities_reads_roster() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"_id": "u1", "id": "u1", "username": "ann"},
            {"_id": "u2", "username": "bob", "password": "ignored"}
        ])))
        .mount(&server)
        .await;

    let identities = HttpChatHistory::new(server.uri())
        .fetch_identities()
        .await
        .unwrap();
    let names: Vec<&str> = identities.iter().map(Identity::display_name).collect();
    assert_eq!(names, vec!["ann", "bob"]);
}

#[tokio::test]
async fn persist_posts_message_and_returns_stored_copy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/messages"))
        .and(body_partial_json(json!({
            "userId": "ann",
            "username": "Ann",
            "content": "hello"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "_id": "m9",
            "user": {"_id": "ann", "username": "Ann"},
            "text": "hello",
            "createdAt": "2024-05-01T10:00:00.000Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let message = Message::public(
        Identity::new(id("ann"), "Ann").unwrap(),
        MessageBody::parse("hello").unwrap(),
        "2024-05-01T10:00:00Z".parse().unwrap(),
    );
    let stored = HttpChatHistory::new(server.uri())
        .persist(message)
        .await
        .unwrap();

    assert_eq!(stored.id.unwrap().as_str(), "m9");
}

#[tokio::test]
async fn error_status_and_bad_payload_are_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/messages"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/users"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let history = HttpChatHistory::new(server.uri());
    assert!(matches!(
        history.fetch_history(None).await,
        Err(HistoryError::Status(503))
    ));
    assert!(matches!(
        history.fetch_identities().await,
        Err(HistoryError::Decode(_))
    ));
}
