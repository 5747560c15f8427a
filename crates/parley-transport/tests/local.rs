//! Integration tests for the in-memory transport.

#[cfg(feature = "local")]
mod local {
    use std::sync::Arc;
    use std::time::Duration;

    use parley_transport::{
        Channel, ChannelEvent, ChannelProvider, ChannelState, ErrorInfo, LocalTransport,
        PresenceAction, PresenceMessage,
    };

    #[tokio::test]
    async fn test_attach_emits_attaching_then_attached_with_serial() {
        let transport = LocalTransport::new("alice");
        let channel = transport.local_channel("room");
        let mut states = channel.on_state_change();

        channel.attach().await.unwrap();

        let first = states.recv().await.unwrap();
        assert_eq!(first.current, ChannelState::Attaching);
        let second = states.recv().await.unwrap();
        assert_eq!(second.current, ChannelState::Attached);
        assert!(!second.resumed);
        assert_eq!(second.attach_serial, channel.attach_serial());
        assert!(channel.attach_serial().is_some());
    }

    #[tokio::test]
    async fn test_attach_when_attached_is_counted_noop() {
        let transport = LocalTransport::new("alice");
        let channel = transport.local_channel("room");
        channel.attach().await.unwrap();
        let serial = channel.attach_serial();

        channel.attach().await.unwrap();

        assert_eq!(channel.attach_calls(), 2);
        assert_eq!(channel.attach_serial(), serial);
    }

    #[tokio::test]
    async fn test_fail_next_attach_leaves_channel_failed() {
        let transport = LocalTransport::new("alice");
        let channel = transport.local_channel("room");
        channel.fail_next_attach(ChannelState::Failed, ErrorInfo::new(90001, 400, "denied"));

        let err = channel.attach().await.unwrap_err();

        assert_eq!(err.reason().map(|r| r.code), Some(90001));
        assert_eq!(channel.state(), ChannelState::Failed);
        assert_eq!(channel.error_reason().map(|r| r.code), Some(90001));

        // The failure is one-shot.
        channel.attach().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Attached);
    }

    #[tokio::test]
    async fn test_fail_next_detach() {
        let transport = LocalTransport::new("alice");
        let channel = transport.local_channel("room");
        channel.attach().await.unwrap();
        channel.fail_next_detach(ErrorInfo::new(90002, 500, "stuck"));

        assert!(channel.detach().await.is_err());
        assert_eq!(channel.state(), ChannelState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_attach_blocks_until_opened() {
        let transport = LocalTransport::new("alice");
        let channel = transport.local_channel("room");
        let gate = channel.hold_attach();

        let task = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.attach().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(channel.state(), ChannelState::Attaching);
        assert!(!task.is_finished());

        gate.open();
        task.await.unwrap().unwrap();
        assert_eq!(channel.state(), ChannelState::Attached);
    }

    #[tokio::test]
    async fn test_emit_non_resumed_attach_changes_serial() {
        let transport = LocalTransport::new("alice");
        let channel = transport.local_channel("room");
        channel.attach().await.unwrap();
        let before = channel.attach_serial().unwrap();

        channel.emit_state(ChannelState::Suspended, false, None);
        assert_eq!(channel.attach_serial(), None);
        channel.emit_state(ChannelState::Attached, false, None);

        let after = channel.attach_serial().unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_publish_stamps_client_and_serial() {
        let transport = LocalTransport::new("alice");
        let channel = transport.local_channel("room");
        let mut events = channel.subscribe();

        channel
            .publish(ChannelEvent::new("roomReaction", serde_json::json!({"type": "like"})))
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.client_id.as_deref(), Some("alice"));
        assert!(event.serial.is_some());
        assert!(event.timestamp > 0);
    }

    #[tokio::test]
    async fn test_presence_enter_and_leave() {
        let transport = LocalTransport::new("alice");
        let channel = transport.local_channel("room");
        let mut presence = channel.on_presence();

        channel.enter_presence(Some(serde_json::json!({"mood": "ok"}))).await.unwrap();
        channel.simulate_presence(PresenceMessage {
            action: PresenceAction::Enter,
            client_id: "bob".into(),
            data: None,
            timestamp: 1,
        });

        let members = channel.presence_members().await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.action == PresenceAction::Present));
        assert_eq!(presence.recv().await.unwrap().client_id, "alice");
        assert_eq!(presence.recv().await.unwrap().client_id, "bob");

        channel.leave_presence(None).await.unwrap();
        let members = channel.presence_members().await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].client_id, "bob");
    }

    #[tokio::test]
    async fn test_release_forgets_channel() {
        let transport = LocalTransport::new("alice");
        let first = transport.local_channel("room");
        transport.release("room");
        let second = transport.local_channel("room");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(transport.released(), vec!["room".to_string()]);
    }

    #[test]
    fn test_random_client_id_prefix() {
        let transport = LocalTransport::with_random_client_id();
        assert!(transport.client_id().starts_with("parley-"));
    }
}
