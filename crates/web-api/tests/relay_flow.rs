//! 中继端到端流程
//!
//! 真实的 WebSocket 连接：客户端侧使用分发门面与 WebSocket 传输，服务端为中继路由。

mod support;

use std::time::Duration;

use application::{EventStream, MessageDispatch};
use domain::{ChatEvent, ConversationKey, IdentityId};
use serde_json::Value;
use support::spawn_relay;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn next_matching(stream: &mut EventStream, wanted: impl Fn(&ChatEvent) -> bool) -> ChatEvent {
    timeout(WAIT, async {
        loop {
            let event = stream.recv().await.expect("event stream closed");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_for_presence(dispatch: &MessageDispatch, count: usize) {
    let mut presence = dispatch.presence().subscribe();
    timeout(WAIT, presence.wait_for(|set| set.len() == count))
        .await
        .expect("timed out waiting for presence")
        .expect("presence closed");
}

fn id(value: &str) -> IdentityId {
    IdentityId::parse(value).unwrap()
}

#[tokio::test]
async fn presence_is_shared_between_clients() {
    let relay = spawn_relay().await;
    let ann = relay.client("ann", "Ann").await;
    let bob = relay.client("bob", "Bob").await;

    wait_for_presence(&ann, 2).await;
    wait_for_presence(&bob, 2).await;
    assert!(ann.presence().is_connected(&id("bob")));
    assert!(relay.state.presence.is_connected(&id("ann")));

    bob.close().await;
    wait_for_presence(&ann, 1).await;
    assert!(!relay.state.presence.is_connected(&id("bob")));

    ann.close().await;
}

#[tokio::test]
async fn public_message_reaches_everyone_once() {
    let relay = spawn_relay().await;
    let ann = relay.client("ann", "Ann").await;
    let bob = relay.client("bob", "Bob").await;
    wait_for_presence(&ann, 2).await;

    let mut ann_events = ann.subscribe();
    let mut bob_events = bob.subscribe();
    ann.send_public("hello room").unwrap();

    for stream in [&mut ann_events, &mut bob_events] {
        let event = next_matching(stream, |e| matches!(e, ChatEvent::PublicMessage(_))).await;
        let ChatEvent::PublicMessage(message) = event else {
            unreachable!()
        };
        assert_eq!(message.body.as_str(), "hello room");
        assert_eq!(message.sender.display_name(), "Ann");
    }

    ann.close().await;
    bob.close().await;
}

#[tokio::test]
async fn private_message_echoes_and_notifies_receiver() {
    let relay = spawn_relay().await;
    let ann = relay.client("ann", "Ann").await;
    let bob = relay.client("bob", "Bob").await;
    wait_for_presence(&ann, 2).await;

    let mut ann_events = ann.subscribe();
    let mut bob_events = bob.subscribe();
    ann.send_private("bob", "psst").unwrap();

    let key = ConversationKey::between(&id("ann"), &id("bob"));
    for stream in [&mut ann_events, &mut bob_events] {
        let event = next_matching(stream, |e| matches!(e, ChatEvent::PrivateMessage(_))).await;
        let ChatEvent::PrivateMessage(message) = event else {
            unreachable!()
        };
        assert_eq!(message.conversation_key(), Some(key.clone()));
        assert_eq!(message.recipient.as_ref().unwrap().display_name(), "Bob");
    }

    let notice = next_matching(&mut bob_events, |e| matches!(e, ChatEvent::Notification(_))).await;
    let ChatEvent::Notification(notice) = notice else {
        unreachable!()
    };
    assert_eq!(notice.message, "new private message from Ann");

    assert_eq!(bob.unread().snapshot(&key), 1);
    assert_eq!(ann.unread().snapshot(&key), 0);
    assert_eq!(ann.unread().total(), 0);

    bob.view_conversation(key.clone());
    assert_eq!(bob.unread().snapshot(&key), 0);

    ann.close().await;
    bob.close().await;
}

#[tokio::test]
async fn keyed_typing_reaches_only_the_peer() {
    let relay = spawn_relay().await;
    let ann = relay.client("ann", "Ann").await;
    let bob = relay.client("bob", "Bob").await;
    let carol = relay.client("carol", "Carol").await;
    wait_for_presence(&ann, 3).await;

    let mut bob_events = bob.subscribe();
    let mut carol_events = carol.subscribe();
    let key = ConversationKey::between(&id("ann"), &id("bob"));
    ann.set_typing(Some(key.clone()), true).unwrap();

    let event = next_matching(&mut bob_events, |e| matches!(e, ChatEvent::TypingChanged(_))).await;
    let ChatEvent::TypingChanged(change) = event else {
        unreachable!()
    };
    assert!(change.is_typing);
    assert_eq!(change.identity.display_name(), "Ann");
    assert_eq!(change.conversation, Some(key.clone()));
    assert!(bob.typing().is_typing(&id("ann"), Some(&key)));

    // 公共房间的输入状态会到达所有其他人；carol 收到的第一个输入事件必须是它
    ann.set_typing(None, true).unwrap();
    let event =
        next_matching(&mut carol_events, |e| matches!(e, ChatEvent::TypingChanged(_))).await;
    let ChatEvent::TypingChanged(change) = event else {
        unreachable!()
    };
    assert_eq!(change.conversation, None);
    assert!(!carol.typing().is_typing(&id("ann"), Some(&key)));

    for client in [ann, bob, carol] {
        client.close().await;
    }
}

#[tokio::test]
async fn connected_endpoint_lists_live_identities() {
    let relay = spawn_relay().await;
    let ann = relay.client("ann", "Ann").await;
    wait_for_presence(&ann, 1).await;

    let client = reqwest::Client::new();
    let listed: Value = client
        .get(relay.http_url("/api/users/connected"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["displayName"], "Ann");

    let missing = client
        .get(relay.http_url("/api/users/connected/nobody"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let health = client.get(relay.http_url("/health")).send().await.unwrap();
    assert!(health.status().is_success());

    ann.close().await;
}
