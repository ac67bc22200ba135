/* Copyright (C) 2023 Admix Pty. Ltd. - All Rights Reserved.
Unauthorized copying of this file, via any medium is strictly prohibited.
Proprietary and confidential. */

//! # Shared state for a tree, with publish/subscribe
//!
//! The blackboard is the shared state of a behavior tree: updated by action
//! nodes, read by conditionals. It is the *only* mutable surface shared
//! between nodes; node-local state is never visible to siblings.
//!
//! Every agent owns one store task; all reads and writes flow through its
//! mailbox, which serializes them. A read that follows a write from the same
//! agent therefore always observes that write. A
//! [`Population`](crate::population::Population) additionally owns one store
//! for the reserved [`SHARED_SEGMENT`], giving its agents an explicitly
//! opted-into cross-agent surface with observably ordered writes.

use std::time::SystemTime;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::agent::AgentId;

/// Keys whose segment equals this route to the population-wide store instead
/// of the agent-local one.
pub const SHARED_SEGMENT: &str = "shared";

/// Segment used by [`BlackboardKey::named`] when the caller doesn't care
/// about namespacing.
pub const DEFAULT_SEGMENT: &str = "agent";

/// A namespaced blackboard key. The segment is the namespace; everything in
/// one segment can be snapshotted together (see
/// [`BlackboardHandle::segment_entries`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BlackboardKey {
    pub segment: String,
    pub name: String,
}

impl BlackboardKey {
    pub fn new(segment: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            segment: segment.into(),
            name: name.into(),
        }
    }

    /// A key in the [`DEFAULT_SEGMENT`].
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_SEGMENT, name)
    }

    /// A key in the cross-agent [`SHARED_SEGMENT`].
    pub fn shared(name: impl Into<String>) -> Self {
        Self::new(SHARED_SEGMENT, name)
    }
}

impl From<(&str, &str)> for BlackboardKey {
    fn from((segment, name): (&str, &str)) -> Self {
        Self::new(segment, name)
    }
}

impl From<&str> for BlackboardKey {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl std::fmt::Display for BlackboardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.segment, self.name)
    }
}

/// What a subscriber wants to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Every change in the store
    All,
    /// Changes to one key
    Key(BlackboardKey),
    /// Changes to any key in a segment
    Segment(String),
}

impl Pattern {
    pub fn matches(&self, key: &BlackboardKey) -> bool {
        match self {
            Pattern::All => true,
            Pattern::Key(k) => k == key,
            Pattern::Segment(segment) => &key.segment == segment,
        }
    }

    fn segment(&self) -> Option<&str> {
        match self {
            Pattern::All => None,
            Pattern::Key(k) => Some(&k.segment),
            Pattern::Segment(segment) => Some(segment),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Put,
    Remove,
}

/// Delivered to subscribers at write time. There is no retroactive delivery:
/// a subscriber only sees changes committed after its subscription landed.
#[derive(Debug, Clone)]
pub struct Change {
    pub key: BlackboardKey,
    pub op: ChangeOp,
    pub old: Option<Value>,
    pub new: Option<Value>,
    pub timestamp: SystemTime,
    pub origin: AgentId,
}

#[derive(Debug)]
struct Entry {
    value: Value,
    written_at: SystemTime,
    origin: AgentId,
}

enum StoreCmd {
    Put {
        key: BlackboardKey,
        value: Value,
        origin: AgentId,
        reply: oneshot::Sender<()>,
    },
    Get {
        key: BlackboardKey,
        reply: oneshot::Sender<Option<Value>>,
    },
    Remove {
        key: BlackboardKey,
        origin: AgentId,
        reply: oneshot::Sender<Option<Value>>,
    },
    Subscribe {
        pattern: Pattern,
        tx: mpsc::UnboundedSender<Change>,
    },
    SegmentEntries {
        segment: String,
        reply: oneshot::Sender<Vec<(BlackboardKey, Value)>>,
    },
}

/// A clonable handle on one store task.
#[derive(Debug, Clone)]
pub(crate) struct StoreHandle {
    tx: mpsc::Sender<StoreCmd>,
}

/// Spawn a store task. The task exits once every handle is dropped.
pub(crate) fn spawn_store() -> StoreHandle {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(Store::default().run(rx));
    StoreHandle { tx }
}

#[derive(Default)]
struct Store {
    entries: ahash::HashMap<BlackboardKey, Entry>,
    subscribers: Vec<(Pattern, mpsc::UnboundedSender<Change>)>,
}

impl Store {
    async fn run(mut self, mut rx: mpsc::Receiver<StoreCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                StoreCmd::Put {
                    key,
                    value,
                    origin,
                    reply,
                } => {
                    let timestamp = SystemTime::now();
                    let old = self.entries.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            written_at: timestamp,
                            origin: origin.clone(),
                        },
                    );
                    self.publish(Change {
                        key,
                        op: ChangeOp::Put,
                        old: old.map(|e| e.value),
                        new: Some(value),
                        timestamp,
                        origin,
                    });
                    let _ = reply.send(());
                }
                StoreCmd::Get { key, reply } => {
                    let _ = reply.send(self.entries.get(&key).map(|e| e.value.clone()));
                }
                StoreCmd::Remove { key, origin, reply } => {
                    let old = self.entries.remove(&key).map(|e| e.value);
                    if old.is_some() {
                        self.publish(Change {
                            key,
                            op: ChangeOp::Remove,
                            old: old.clone(),
                            new: None,
                            timestamp: SystemTime::now(),
                            origin,
                        });
                    }
                    let _ = reply.send(old);
                }
                StoreCmd::Subscribe { pattern, tx } => {
                    self.subscribers.push((pattern, tx));
                }
                StoreCmd::SegmentEntries { segment, reply } => {
                    let entries = self
                        .entries
                        .iter()
                        .filter(|(k, _)| k.segment == segment)
                        .map(|(k, e)| (k.clone(), e.value.clone()))
                        .collect();
                    let _ = reply.send(entries);
                }
            }
        }
    }

    /// Fan a change out to matching subscribers, dropping any whose receiver
    /// has gone away.
    fn publish(&mut self, change: Change) {
        self.subscribers.retain(|(pattern, tx)| {
            if !pattern.matches(&change.key) {
                return !tx.is_closed();
            }
            tx.send(change.clone()).is_ok()
        });
    }
}

impl StoreHandle {
    async fn command(&self, cmd: StoreCmd) -> bool {
        self.tx.send(cmd).await.is_ok()
    }
}

/// Per-agent view of the blackboard. Cheap to clone; carried in every
/// [`TickCtx`](crate::action::TickCtx).
///
/// Keys in the [`SHARED_SEGMENT`] route to the population-wide store when the
/// agent belongs to a [`Population`](crate::population::Population);
/// otherwise they fall back to the agent-local store.
#[derive(Debug, Clone)]
pub struct BlackboardHandle {
    origin: AgentId,
    local: StoreHandle,
    shared: Option<StoreHandle>,
}

impl BlackboardHandle {
    pub(crate) fn new(origin: AgentId, local: StoreHandle, shared: Option<StoreHandle>) -> Self {
        Self {
            origin,
            local,
            shared,
        }
    }

    fn store_for_segment(&self, segment: &str) -> &StoreHandle {
        match &self.shared {
            Some(shared) if segment == SHARED_SEGMENT => shared,
            _ => &self.local,
        }
    }

    /// Write a value. Last writer wins; the write is committed once this
    /// returns.
    pub async fn put(&self, key: impl Into<BlackboardKey>, value: impl Into<Value>) {
        let key = key.into();
        let (reply, ack) = oneshot::channel();
        let sent = self
            .store_for_segment(&key.segment)
            .command(StoreCmd::Put {
                key,
                value: value.into(),
                origin: self.origin.clone(),
                reply,
            })
            .await;
        if !sent || ack.await.is_err() {
            log::warn!("blackboard store is gone; put dropped");
        }
    }

    /// Read a value. A missing key is `None`, never an error.
    pub async fn get(&self, key: impl Into<BlackboardKey>) -> Option<Value> {
        let key = key.into();
        let (reply, value) = oneshot::channel();
        if !self
            .store_for_segment(&key.segment)
            .command(StoreCmd::Get { key, reply })
            .await
        {
            return None;
        }
        value.await.ok().flatten()
    }

    /// Remove a key, returning the value it held.
    pub async fn remove(&self, key: impl Into<BlackboardKey>) -> Option<Value> {
        let key = key.into();
        let (reply, old) = oneshot::channel();
        if !self
            .store_for_segment(&key.segment)
            .command(StoreCmd::Remove {
                key,
                origin: self.origin.clone(),
                reply,
            })
            .await
        {
            return None;
        }
        old.await.ok().flatten()
    }

    /// Subscribe to changes matching `pattern`. Delivery starts with the
    /// first change committed after the subscription; a dropped receiver
    /// unsubscribes on the next matching write.
    pub async fn subscribe(&self, pattern: Pattern) -> mpsc::UnboundedReceiver<Change> {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = match pattern.segment() {
            Some(segment) => self.store_for_segment(segment),
            None => &self.local,
        };
        if !store.command(StoreCmd::Subscribe { pattern, tx }).await {
            log::warn!("blackboard store is gone; subscription is inert");
        }
        rx
    }

    /// Snapshot every entry in a segment. This is the surface a host uses to
    /// checkpoint state it cares about.
    pub async fn segment_entries(&self, segment: impl Into<String>) -> Vec<(BlackboardKey, Value)> {
        let segment = segment.into();
        let (reply, entries) = oneshot::channel();
        if !self
            .store_for_segment(&segment)
            .command(StoreCmd::SegmentEntries { segment, reply })
            .await
        {
            return vec![];
        }
        entries.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn handle() -> BlackboardHandle {
        BlackboardHandle::new(AgentId::new("test-agent"), spawn_store(), None)
    }

    #[tokio::test]
    async fn get_after_put_observes_the_put() {
        let bb = handle();
        bb.put("target", serde_json::json!([1.0, 2.0])).await;
        assert_eq!(bb.get("target").await, Some(serde_json::json!([1.0, 2.0])));
        assert_eq!(bb.get("missing").await, None);
    }

    #[tokio::test]
    async fn remove_returns_old_value() {
        let bb = handle();
        bb.put("k", 1).await;
        assert_eq!(bb.remove("k").await, Some(serde_json::json!(1)));
        assert_eq!(bb.get("k").await, None);
        assert_eq!(bb.remove("k").await, None);
    }

    #[tokio::test]
    async fn subscribers_see_matching_changes_in_order() {
        let bb = handle();
        let mut all = bb.subscribe(Pattern::All).await;
        let mut keyed = bb.subscribe(Pattern::Key(BlackboardKey::named("a"))).await;

        bb.put("a", 1).await;
        bb.put("b", 2).await;
        bb.remove("a").await;

        let change = all.recv().await.unwrap();
        assert_eq!(change.key, BlackboardKey::named("a"));
        assert_eq!(change.op, ChangeOp::Put);
        assert_eq!(change.old, None);
        assert_eq!(change.new, Some(serde_json::json!(1)));
        assert_eq!(all.recv().await.unwrap().key, BlackboardKey::named("b"));
        assert_eq!(all.recv().await.unwrap().op, ChangeOp::Remove);

        // the keyed subscriber never hears about "b"
        assert_eq!(keyed.recv().await.unwrap().op, ChangeOp::Put);
        let removal = keyed.recv().await.unwrap();
        assert_eq!(removal.op, ChangeOp::Remove);
        assert_eq!(removal.old, Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn no_retroactive_delivery() {
        let bb = handle();
        bb.put("before", 1).await;
        let mut rx = bb.subscribe(Pattern::All).await;
        bb.put("after", 2).await;
        assert_eq!(rx.recv().await.unwrap().key, BlackboardKey::named("after"));
    }

    #[tokio::test]
    async fn segment_snapshot_is_scoped() {
        let bb = handle();
        bb.put(("nav", "x"), 1).await;
        bb.put(("nav", "y"), 2).await;
        bb.put(("other", "z"), 3).await;

        let mut entries = bb.segment_entries("nav").await;
        entries.sort_by(|(a, _), (b, _)| a.name.cmp(&b.name));
        assert_eq!(
            entries,
            vec![
                (BlackboardKey::new("nav", "x"), serde_json::json!(1)),
                (BlackboardKey::new("nav", "y"), serde_json::json!(2)),
            ]
        );
    }
}
