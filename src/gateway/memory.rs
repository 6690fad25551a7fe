//! 单进程内存实现 / In-process implementations of the collaborator interfaces
//!
//! 单机部署与测试使用；多进程部署替换为分布式实现即可，上层代码无需改动。
//! Used by single-process deployments and tests; multi-process deployments swap in distributed ones.

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::{ConversationDirectory, DistributedLock, EphemeralCache, MessageQueue, PushChannel};
use crate::domain::{
    Conversation, ConversationExtra, ConversationStatus, ConversationType, DispatchEnvelope,
    Identity, PushPayload,
};
use crate::priority::Priority;

/// 按优先级分通道的内存队列 / In-memory queue with one channel per priority tier
pub struct MemoryQueue {
    senders: Vec<mpsc::UnboundedSender<DispatchEnvelope>>,
    receiver: Mutex<Option<PriorityReceiver>>,
    available: AtomicBool,
}

/// 队列消费端：总是先取高优先级 / Consumer side; higher tiers are always drained first
pub struct PriorityReceiver {
    highest: mpsc::UnboundedReceiver<DispatchEnvelope>,
    high: mpsc::UnboundedReceiver<DispatchEnvelope>,
    medium: mpsc::UnboundedReceiver<DispatchEnvelope>,
    low: mpsc::UnboundedReceiver<DispatchEnvelope>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let mut senders = Vec::with_capacity(Priority::ALL.len());
        let mut receivers = Vec::with_capacity(Priority::ALL.len());
        for _ in Priority::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }
        let mut it = receivers.into_iter();
        let receiver = match (it.next(), it.next(), it.next(), it.next()) {
            (Some(highest), Some(high), Some(medium), Some(low)) => Some(PriorityReceiver {
                highest,
                high,
                medium,
                low,
            }),
            _ => None,
        };
        Self {
            senders,
            receiver: Mutex::new(receiver),
            available: AtomicBool::new(true),
        }
    }

    /// 取走消费端（只能取一次）/ Take the consumer side; only the first call gets it
    pub fn take_receiver(&self) -> Option<PriorityReceiver> {
        self.receiver.lock().take()
    }

    /// 模拟队列故障 / Simulate an outage
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, envelope: DispatchEnvelope) -> anyhow::Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(anyhow!("message queue unavailable"));
        }
        let sender = self
            .senders
            .get(envelope.priority.index())
            .ok_or_else(|| anyhow!("no channel for priority {:?}", envelope.priority))?;
        debug!("📤 入队 / publish {} at {:?}", envelope.event_id, envelope.priority);
        sender
            .send(envelope)
            .map_err(|e| anyhow!("message queue closed: {}", e))
    }
}

impl PriorityReceiver {
    /// 等待下一条消息 / Wait for the next envelope, highest tier first
    pub async fn recv(&mut self) -> Option<DispatchEnvelope> {
        tokio::select! {
            biased;
            Some(env) = self.highest.recv() => Some(env),
            Some(env) = self.high.recv() => Some(env),
            Some(env) = self.medium.recv() => Some(env),
            Some(env) = self.low.recv() => Some(env),
            else => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<DispatchEnvelope> {
        self.highest
            .try_recv()
            .or_else(|_| self.high.try_recv())
            .or_else(|_| self.medium.try_recv())
            .or_else(|_| self.low.try_recv())
            .ok()
    }

    /// 取出当前所有待处理消息 / Drain everything currently queued
    pub fn drain(&mut self) -> Vec<DispatchEnvelope> {
        let mut res = Vec::new();
        while let Some(env) = self.try_recv() {
            res.push(env);
        }
        res
    }
}

#[derive(Debug, Clone)]
struct Expiring {
    value: String,
    expires_at: Instant,
}

impl Expiring {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// 内存缓存，同时提供锁 / In-memory cache that also serves as the lock backend
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Expiring>,
    locks: DashMap<String, Expiring>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 未过期的条目数 / Number of live entries
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EphemeralCache for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let hit = self.entries.get(key).map(|e| e.value().clone());
        match hit {
            Some(e) if e.is_live() => Ok(Some(e.value)),
            Some(_) => {
                self.entries.remove_if(key, |_, e| !e.is_live());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), Expiring::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[async_trait]
impl DistributedLock for MemoryCache {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool> {
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                // 过期锁可被抢占 / an expired lock can be taken over
                if e.get().is_live() {
                    Ok(false)
                } else {
                    e.insert(Expiring::new(owner.to_string(), ttl));
                    Ok(true)
                }
            }
            Entry::Vacant(e) => {
                e.insert(Expiring::new(owner.to_string(), ttl));
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str, owner: &str) -> anyhow::Result<bool> {
        Ok(self.locks.remove_if(key, |_, e| e.value == owner).is_some())
    }
}

/// 记录所有推送的内存推送通道 / Push channel that records every push
#[derive(Default)]
pub struct MemoryPushChannel {
    pushes: Mutex<Vec<(String, PushPayload)>>,
    failing: Mutex<HashSet<String>>,
    notify: Notify,
}

impl MemoryPushChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让某身份的推送失败 / Make pushes to this identity fail
    pub fn fail_for(&self, identity: &str) {
        self.failing.lock().insert(identity.to_string());
    }

    pub fn pushes(&self) -> Vec<(String, PushPayload)> {
        self.pushes.lock().clone()
    }

    pub fn pushes_for(&self, identity: &str) -> Vec<PushPayload> {
        self.pushes
            .lock()
            .iter()
            .filter(|(to, _)| to == identity)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.pushes.lock().clear();
    }

    /// 等待累计推送数达到 `count` / Wait until at least `count` pushes were recorded
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.pushes.lock().len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pushes.lock().len() >= count;
            }
        }
    }
}

#[async_trait]
impl PushChannel for MemoryPushChannel {
    async fn push_to_identity(&self, identity: &str, payload: PushPayload) -> anyhow::Result<()> {
        if self.failing.lock().contains(identity) {
            return Err(anyhow!("push channel rejected {}", identity));
        }
        self.pushes.lock().push((identity.to_string(), payload));
        self.notify.notify_waiters();
        Ok(())
    }
}

/// 内存会话目录 / In-memory conversation directory
#[derive(Default)]
pub struct MemoryDirectory {
    conversations: DashMap<String, Conversation>,
    // (owner, receive_id) -> conversation id
    windows: DashMap<(String, String), String>,
    groups: DashMap<String, Vec<Identity>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conversation: Conversation) {
        self.windows.insert(
            (conversation.user_id.clone(), conversation.receive_id.clone()),
            conversation.id.clone(),
        );
        self.conversations.insert(conversation.id.clone(), conversation);
    }

    /// 为两个身份建立互相的单聊窗口 / Open both windows of a direct chat
    pub fn open_direct(&self, a: &Identity, b: &Identity) -> (Conversation, Conversation) {
        let left = self.open_window(a, &b.id, ConversationType::from(b.kind), &b.organization_code);
        let right = self.open_window(b, &a.id, ConversationType::from(a.kind), &a.organization_code);
        (left, right)
    }

    /// 登记群成员 / Register the members of a group
    pub fn register_group(&self, group_id: &str, members: Vec<Identity>) {
        self.groups.insert(group_id.to_string(), members);
    }

    fn open_window(
        &self,
        owner: &Identity,
        receive_id: &str,
        receive_type: ConversationType,
        receive_organization_code: &str,
    ) -> Conversation {
        let key = (owner.id.clone(), receive_id.to_string());
        match self.windows.entry(key) {
            Entry::Occupied(mut e) => {
                if let Some(mut conv) = self.conversations.get_mut(e.get()) {
                    if conv.status == ConversationStatus::Deleted {
                        conv.status = ConversationStatus::Normal;
                    }
                    return conv.clone();
                }
                // 索引悬空时重建 / dangling index entry, rebuild the window
                let conversation = new_window(owner, receive_id, receive_type, receive_organization_code);
                self.conversations.insert(conversation.id.clone(), conversation.clone());
                e.insert(conversation.id.clone());
                conversation
            }
            Entry::Vacant(e) => {
                let conversation = new_window(owner, receive_id, receive_type, receive_organization_code);
                self.conversations.insert(conversation.id.clone(), conversation.clone());
                e.insert(conversation.id.clone());
                conversation
            }
        }
    }
}

fn new_window(
    owner: &Identity,
    receive_id: &str,
    receive_type: ConversationType,
    receive_organization_code: &str,
) -> Conversation {
    Conversation {
        id: uuid::Uuid::new_v4().simple().to_string(),
        user_id: owner.id.clone(),
        user_organization_code: owner.organization_code.clone(),
        receive_id: receive_id.to_string(),
        receive_type,
        receive_organization_code: receive_organization_code.to_string(),
        status: ConversationStatus::Normal,
        extra: ConversationExtra::default(),
    }
}

#[async_trait]
impl ConversationDirectory for MemoryDirectory {
    async fn get_conversation(&self, conversation_id: &str) -> anyhow::Result<Option<Conversation>> {
        Ok(self.conversations.get(conversation_id).map(|c| c.value().clone()))
    }

    async fn get_or_create_conversation(
        &self,
        owner: &Identity,
        receive_id: &str,
        receive_type: ConversationType,
        receive_organization_code: &str,
    ) -> anyhow::Result<Conversation> {
        Ok(self.open_window(owner, receive_id, receive_type, receive_organization_code))
    }

    async fn group_members(&self, group_id: &str) -> anyhow::Result<Vec<Identity>> {
        self.groups
            .get(group_id)
            .map(|m| m.value().clone())
            .ok_or_else(|| anyhow!("group {} not found", group_id))
    }

    async fn update_status(&self, conversation_id: &str, status: ConversationStatus) -> anyhow::Result<()> {
        let mut conv = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| anyhow!("conversation {} not found", conversation_id))?;
        conv.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DispatchEvent;

    #[tokio::test]
    async fn test_queue_drains_highest_first() {
        let queue = MemoryQueue::new();
        let mut rx = queue.take_receiver().unwrap();
        assert!(queue.take_receiver().is_none());
        for p in [Priority::Low, Priority::Medium, Priority::Highest, Priority::High] {
            queue
                .publish(DispatchEnvelope::new(p, DispatchEvent::Deliver { seq_ids: vec![1] }))
                .await
                .unwrap();
        }
        let order: Vec<Priority> = rx.drain().into_iter().map(|e| e.priority).collect();
        assert_eq!(order, Priority::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_queue_outage() {
        let queue = MemoryQueue::new();
        queue.set_available(false);
        let env = DispatchEnvelope::new(Priority::High, DispatchEvent::Deliver { seq_ids: vec![] });
        assert!(queue.publish(env.clone()).await.is_err());
        queue.set_available(true);
        assert!(queue.publish(env).await.is_ok());
    }

    #[tokio::test]
    async fn test_cache_ttl_and_delete() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        cache.set("gone", "v".into(), Duration::from_millis(0)).await.unwrap();
        assert!(cache.get("gone").await.unwrap().is_none());
        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_ownership() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(5);
        assert!(cache.try_lock("l", "a", ttl).await.unwrap());
        assert!(!cache.try_lock("l", "b", ttl).await.unwrap());
        assert!(!cache.unlock("l", "b").await.unwrap());
        assert!(cache.unlock("l", "a").await.unwrap());
        assert!(cache.try_lock("l", "b", ttl).await.unwrap());
        // 过期锁可被抢占 / expired locks are taken over
        assert!(cache.try_lock("e", "a", Duration::from_millis(0)).await.unwrap());
        assert!(cache.try_lock("e", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_directory_restores_deleted_window() {
        let dir = MemoryDirectory::new();
        let a = Identity::user("a", "org");
        let b = Identity::ai("bot", "org");
        let (ab, ba) = dir.open_direct(&a, &b);
        assert_eq!(ab.receive_type, ConversationType::Ai);
        assert_eq!(ba.receive_type, ConversationType::User);
        dir.update_status(&ba.id, ConversationStatus::Deleted).await.unwrap();
        let again = dir
            .get_or_create_conversation(&b, "a", ConversationType::User, "org")
            .await
            .unwrap();
        assert_eq!(again.id, ba.id);
        assert_eq!(again.status, ConversationStatus::Normal);
    }

    #[tokio::test]
    async fn test_push_channel_failure_and_wait() {
        let push = MemoryPushChannel::new();
        push.fail_for("x");
        let payload = PushPayload::Intermediate {
            conversation_id: "c".into(),
            sender_id: "s".into(),
            content: crate::domain::ControlContent::TypingState { typing: true },
        };
        assert!(push.push_to_identity("x", payload.clone()).await.is_err());
        push.push_to_identity("y", payload).await.unwrap();
        assert!(push.wait_for(1, Duration::from_millis(10)).await);
        assert_eq!(push.pushes_for("y").len(), 1);
    }
}
