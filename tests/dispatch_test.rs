//! 分发器集成测试 / Fan-out dispatcher integration tests

mod common;

use common::{agent, user, Harness, ORG};
use std::collections::HashSet;
use v_im_seq::domain::{
    ControlContent, Conversation, ConversationExtra, ConversationStatus, ConversationType,
    DispatchEvent, MessageContent, MessageStatus,
};
use v_im_seq::gateway::ConversationDirectory;
use v_im_seq::storage::{MessageStore, SequenceStore};
use v_im_seq::tasks::sweep_once;
use v_im_seq::{Priority, SendRequest, SeqError};

#[tokio::test]
async fn test_direct_send_then_seen() {
    let mut h = Harness::new();
    let (a, b) = (user("alice"), user("bob"));
    let (a_conv, _) = h.direct(&a, &b);

    let sent = h
        .engine
        .dispatcher()
        .dispatch_send(SendRequest::new(a.clone(), &a_conv.id, MessageContent::text("hi")))
        .await
        .unwrap();
    assert_eq!(sent.status, MessageStatus::Read);
    assert_eq!(sent.receive_list.as_ref().unwrap().unread_list, vec!["bob"]);
    assert!(sent.sender_message_id.is_none());

    let theirs = h.holder(&sent.magic_message_id, "bob").await;
    assert_eq!(theirs.status, MessageStatus::Unread);
    assert_eq!(theirs.sender_message_id.as_deref(), Some(sent.message_id.as_str()));
    assert_ne!(theirs.message_id, sent.message_id);
    // 发送方记录先于接收方生成 / the sender's record is generated first
    assert!(sent.seq_id < theirs.seq_id);

    let handled = h.pump().await;
    assert_eq!(handled.len(), 1);
    assert_eq!(handled[0].priority, Priority::Highest);
    assert_eq!(
        handled[0].event,
        DispatchEvent::Deliver {
            seq_ids: vec![theirs.seq_id, sent.seq_id]
        }
    );
    assert_eq!(h.seq_pushes_for("bob").len(), 1);
    assert_eq!(h.seq_pushes_for("alice").len(), 1);

    let controls = h
        .engine
        .control()
        .seen_messages(&b, &[theirs.message_id.clone()])
        .await
        .unwrap();
    assert_eq!(controls.len(), 2);
    h.pump().await;

    let sender_side = h.store().get_by_seq_id(sent.seq_id).await.unwrap().unwrap();
    let list = sender_side.receive_list.unwrap();
    assert!(list.unread_list.is_empty());
    assert_eq!(list.seen_list, vec!["bob"]);
    let receiver_side = h.store().get_by_seq_id(theirs.seq_id).await.unwrap().unwrap();
    assert_eq!(receiver_side.status, MessageStatus::Seen);

    // alice 侧的新记录记录了这次变化 / a new record on alice's side documents the change
    let doc = controls.iter().find(|c| c.object_id == "alice").unwrap();
    assert_eq!(doc.status, MessageStatus::Unread);
    assert_eq!(
        doc.content,
        Some(ControlContent::SeenMessages {
            refer_message_ids: vec![sent.message_id.clone()]
        })
    );
    assert!(h.seq_pushes_for("alice").iter().any(|s| s.seq_id == doc.seq_id));
}

#[tokio::test]
async fn test_duplicate_app_message_id_is_idempotent() {
    let mut h = Harness::new();
    let (a, b) = (user("alice"), user("bob"));
    let (a_conv, _) = h.direct(&a, &b);
    let req = SendRequest::new(a.clone(), &a_conv.id, MessageContent::text("once")).with_app_message_id("app-1");

    let first = h.engine.dispatcher().dispatch_send(req.clone()).await.unwrap();
    let second = h.engine.dispatcher().dispatch_send(req).await.unwrap();
    assert_eq!(first.seq_id, second.seq_id);
    assert_eq!(h.queued().len(), 1);
    assert_eq!(
        h.store()
            .get_both_sides_by_magic_message_id(&first.magic_message_id)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn test_reply_reference_is_rewritten_per_recipient() {
    let mut h = Harness::new();
    let (a, b) = (user("alice"), user("bob"));
    let (a_conv, b_conv) = h.direct(&a, &b);

    let original = h
        .engine
        .dispatcher()
        .dispatch_send(SendRequest::new(a.clone(), &a_conv.id, MessageContent::text("question")))
        .await
        .unwrap();
    let bob_copy = h.holder(&original.magic_message_id, "bob").await;

    let reply = h
        .engine
        .dispatcher()
        .dispatch_send(
            SendRequest::new(b.clone(), &b_conv.id, MessageContent::text("answer"))
                .with_refer(bob_copy.message_id.clone()),
        )
        .await
        .unwrap();
    assert_eq!(reply.refer_message_id.as_deref(), Some(bob_copy.message_id.as_str()));
    let alice_copy = h.holder(&reply.magic_message_id, "alice").await;
    assert_eq!(alice_copy.refer_message_id.as_deref(), Some(original.message_id.as_str()));
    h.pump().await;
}

#[tokio::test]
async fn test_topic_defaults_to_conversation_topic() {
    let h = Harness::new();
    let (a, b) = (user("alice"), user("bob"));
    let a_conv = Conversation {
        id: "conv-a".to_string(),
        user_id: a.id.clone(),
        user_organization_code: ORG.to_string(),
        receive_id: b.id.clone(),
        receive_type: ConversationType::User,
        receive_organization_code: ORG.to_string(),
        status: ConversationStatus::Normal,
        extra: ConversationExtra {
            default_topic_id: Some("topic-7".to_string()),
        },
    };
    h.directory.insert(a_conv);

    let sent = h
        .engine
        .dispatcher()
        .dispatch_send(SendRequest::new(a.clone(), "conv-a", MessageContent::text("t")))
        .await
        .unwrap();
    assert_eq!(sent.extra.topic_id.as_deref(), Some("topic-7"));
    let theirs = h.holder(&sent.magic_message_id, "bob").await;
    assert_eq!(theirs.extra.topic_id.as_deref(), Some("topic-7"));

    let explicit = h
        .engine
        .dispatcher()
        .dispatch_send(SendRequest::new(a, "conv-a", MessageContent::text("t")).with_topic("topic-9"))
        .await
        .unwrap();
    assert_eq!(explicit.extra.topic_id.as_deref(), Some("topic-9"));
}

#[tokio::test]
async fn test_group_of_150_fans_out_at_medium() {
    let mut h = Harness::new();
    let members: Vec<_> = (0..151).map(|i| user(&format!("m{}", i))).collect();
    let windows = h.group("g-1", &members).await;
    let sender = &members[0];

    let sent = h
        .engine
        .dispatcher()
        .dispatch_send(SendRequest::new(sender.clone(), &windows[0].id, MessageContent::text("hello all")))
        .await
        .unwrap();
    assert_eq!(sent.receive_list.as_ref().unwrap().unread_list.len(), 150);

    let queued = h.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].priority, Priority::Medium);
    assert_eq!(
        queued[0].event,
        DispatchEvent::GroupFanOut {
            sender_seq_id: sent.seq_id
        }
    );
    h.engine.on_dispatch_event(&queued[0]).await.unwrap();

    let all = h
        .store()
        .get_both_sides_by_magic_message_id(&sent.magic_message_id)
        .await
        .unwrap();
    assert_eq!(all.len(), 151);
    let receivers: Vec<_> = all.iter().filter(|s| s.is_receiver_side()).collect();
    assert_eq!(receivers.len(), 150);
    let ids: HashSet<&str> = all.iter().map(|s| s.message_id.as_str()).collect();
    assert_eq!(ids.len(), 151);
    for r in &receivers {
        assert_eq!(r.magic_message_id, sent.magic_message_id);
        assert_eq!(r.sender_message_id.as_deref(), Some(sent.message_id.as_str()));
        assert_eq!(r.status, MessageStatus::Unread);
    }

    // 重跑扇出不产生重复记录 / re-running the fan-out creates nothing new
    let again = h.engine.dispatcher().fan_out_group(sent.seq_id).await.unwrap();
    assert!(again.is_empty());
    h.settle().await;
    assert_eq!(h.seq_pushes_for("m42").len(), 1);
}

#[tokio::test]
async fn test_small_group_is_highest() {
    let mut h = Harness::new();
    let members: Vec<_> = (0..5).map(|i| user(&format!("s{}", i))).collect();
    let windows = h.group("g-small", &members).await;
    h.engine
        .dispatcher()
        .dispatch_send(SendRequest::new(members[0].clone(), &windows[0].id, MessageContent::text("yo")))
        .await
        .unwrap();
    let handled = h.pump().await;
    assert_eq!(handled[0].priority, Priority::Highest);
    assert_eq!(h.seq_pushes_for("s3").len(), 1);
}

#[tokio::test]
async fn test_hidden_receiver_window_reopens() {
    let h = Harness::new();
    let (a, b) = (user("alice"), agent("bot"));
    let (a_conv, b_conv) = h.direct(&a, &b);
    h.directory
        .update_status(&b_conv.id, ConversationStatus::Hidden)
        .await
        .unwrap();

    h.engine
        .dispatcher()
        .dispatch_send(SendRequest::new(a, &a_conv.id, MessageContent::text("wake up")))
        .await
        .unwrap();
    let window = h.directory.get_conversation(&b_conv.id).await.unwrap().unwrap();
    assert_eq!(window.status, ConversationStatus::Normal);
}

#[tokio::test]
async fn test_validation_errors_write_nothing() {
    let h = Harness::new();
    let (a, b) = (user("alice"), user("bob"));
    let (_, b_conv) = h.direct(&a, &b);

    let err = h
        .engine
        .dispatcher()
        .dispatch_send(SendRequest::new(a.clone(), "missing", MessageContent::text("x")))
        .await
        .unwrap_err();
    assert!(matches!(err, SeqError::ConversationNotFound { .. }));

    // 不能以他人的会话发送 / cannot send through someone else's window
    let err = h
        .engine
        .dispatcher()
        .dispatch_send(SendRequest::new(a.clone(), &b_conv.id, MessageContent::text("x")))
        .await
        .unwrap_err();
    assert!(matches!(err, SeqError::ConversationNotFound { .. }));

    h.directory.insert(Conversation {
        id: "sys".to_string(),
        user_id: a.id.clone(),
        user_organization_code: ORG.to_string(),
        receive_id: "notices".to_string(),
        receive_type: ConversationType::System,
        receive_organization_code: ORG.to_string(),
        status: ConversationStatus::Normal,
        extra: ConversationExtra::default(),
    });
    let err = h
        .engine
        .dispatcher()
        .dispatch_send(
            SendRequest::new(a, "sys", MessageContent::text("x")).with_app_message_id("sys-1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SeqError::ConversationTypeError { .. }));
    assert!(!h.store().is_already_sent("sys-1", &[]).await.unwrap());
}

#[tokio::test]
async fn test_queue_outage_is_surfaced_and_swept() {
    let mut h = Harness::new();
    let (a, b) = (user("alice"), user("bob"));
    let (a_conv, _) = h.direct(&a, &b);

    h.queue.set_available(false);
    let err = h
        .engine
        .dispatcher()
        .dispatch_send(
            SendRequest::new(a.clone(), &a_conv.id, MessageContent::text("lost?")).with_app_message_id("out-1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SeqError::MessageDeliveryFailed { .. }));
    assert!(err.is_retryable());

    // 记录已落库，不回滚 / the records stay durable
    let sent = h.store().get_by_app_message_id("alice", "out-1").await.unwrap().unwrap();
    let ctx = h.engine.context();
    assert_eq!(ctx.pending.len(), 1);

    h.queue.set_available(true);
    assert_eq!(sweep_once(&ctx.pending, ctx.queue.as_ref()).await, 1);
    assert!(ctx.pending.is_empty());
    let handled = h.pump().await;
    assert_eq!(handled.len(), 1);
    assert!(handled[0].event.seq_ids().contains(&sent.seq_id));
    assert_eq!(h.seq_pushes_for("bob").len(), 1);
}
