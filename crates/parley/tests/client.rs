//! Integration tests for the chat client facade.

use std::sync::Arc;
use std::time::Duration;

use parley::prelude::*;
use parley::room::LocalChatApi;
use parley::transport::{Channel, ChannelState, LocalTransport};

// =========================================================================
// Helpers
// =========================================================================

fn client() -> (Arc<LocalTransport>, ChatClient) {
    let transport = Arc::new(LocalTransport::new("alice"));
    let api = Arc::new(LocalChatApi::new(transport.clone()));
    let client = ChatClient::builder().build(transport.clone(), api);
    (transport, client)
}

async fn send(room: &Room, text: &str) -> Result<Message, ChatError> {
    let message = room
        .messages()
        .send(SendMessageParams {
            text: text.into(),
            ..SendMessageParams::default()
        })
        .await?;
    Ok(message)
}

// =========================================================================
// Building
// =========================================================================

#[tokio::test]
async fn test_client_id_comes_from_provider() {
    let (_transport, client) = client();
    assert_eq!(client.client_id(), "alice");
    assert_eq!(client.rooms().count(), 0);
}

#[tokio::test]
async fn test_build_local_uses_configured_client_id() {
    let client = ChatClient::builder()
        .options(ClientOptions {
            client_id: Some("carol".into()),
            ..ClientOptions::default()
        })
        .build_local();
    assert_eq!(client.client_id(), "carol");

    let anonymous = ChatClient::builder().build_local();
    assert!(anonymous.client_id().starts_with("parley-"));
}

#[tokio::test]
async fn test_options_from_json() {
    let client = ChatClient::builder()
        .options_json(r#"{ "log_level": "debug", "client_id": "dave" }"#)
        .unwrap()
        .build_local();
    assert_eq!(client.options().log_level, "debug");
    assert_eq!(client.options().retry_timeout, Duration::from_millis(250));
    assert_eq!(client.client_id(), "dave");

    let err = ChatClient::builder().options_json("{ nope").unwrap_err();
    assert!(matches!(err, ChatError::Options(_)));
}

// =========================================================================
// End to end
// =========================================================================

#[tokio::test]
async fn test_chat_round_trip() {
    let (transport, client) = client();
    let room = client
        .rooms()
        .get("lobby", RoomOptions::all_features())
        .await
        .unwrap();
    room.attach().await.unwrap();
    let mut sub = room.messages().subscribe();

    let sent = send(&room, "hi").await.unwrap();
    let received = sub.recv().await.unwrap();
    assert_eq!(received.message, sent);
    assert_eq!(received.message.client_id, "alice");

    room.reactions()
        .unwrap()
        .send(SendReactionParams {
            kind: "like".into(),
            ..SendReactionParams::default()
        })
        .await
        .unwrap();

    let messages = transport.local_channel("lobby::$chat::$chatMessages");
    client.rooms().release("lobby").await.unwrap();
    assert_eq!(room.status(), RoomStatus::Released);
    assert_eq!(messages.state(), ChannelState::Detached);
    assert_eq!(client.rooms().count(), 0);
}

#[tokio::test]
async fn test_errors_convert_into_chat_error() {
    let (transport, client) = client();
    transport
        .local_channel("lobby::$chat::$chatMessages")
        .fail_next_attach(ChannelState::Failed, ErrorInfo::new(90000, 500, "boom"));

    async fn attach(client: &ChatClient) -> Result<(), ChatError> {
        let room = client.rooms().get("lobby", None).await?;
        room.attach().await?;
        Ok(())
    }

    let err = attach(&client).await.unwrap_err();
    assert!(matches!(err, ChatError::Room(_)));
    let info = err.info().unwrap();
    assert!(ErrorCode::MessagesAttachmentFailed.matches(info));
    assert_eq!(info.cause.as_ref().map(|c| c.code), Some(90000));

    let room = client.rooms().get("lobby", None).await.unwrap();
    let err: ChatError = room.typing().err().unwrap().into();
    assert!(err.to_string().contains("typing"));
}
