//! Subscription store: a segment trie for ordinary filters plus a
//! group-bucketed side table for `$share` subscriptions.
//!
//! The trie keys each level into a literal-child map with distinguished
//! `+` and `#` slots, so a lookup costs O(levels × branching) instead of a
//! scan over every subscription. Matching dominates mutation, so the whole
//! index sits behind a reader-writer lock.

use crate::error::StoreError;
use crate::protocol::{QoS, RetainHandling};
use crate::topic;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Options attached to one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    pub max_qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
    pub subscription_id: Option<u32>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            max_qos: QoS::AtMostOnce,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::SendAtSubscribe,
            subscription_id: None,
        }
    }
}

/// One stored subscription as the client expressed it. `filter` keeps the
/// full original form (including any `$share/<group>/` prefix) so that
/// UNSUBSCRIBE round-trips; `shared_group` and `match_filter` carry the
/// split-out pieces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSubscription {
    pub filter: String,
    pub shared_group: Option<String>,
    pub options: SubscriptionOptions,
}

impl ClientSubscription {
    /// The filter actually matched against topics.
    pub fn match_filter(&self) -> &str {
        match &self.shared_group {
            Some(group) => &self.filter[topic::SHARE_PREFIX.len() + group.len() + 1..],
            None => &self.filter,
        }
    }
}

/// A shared group matched by a topic, with every live member.
#[derive(Debug, Clone)]
pub struct SharedMatch {
    pub filter: String,
    pub group: String,
    pub members: Vec<(String, SubscriptionOptions)>,
}

/// Everything a topic matched: direct subscribers (possibly several
/// entries per client when filters overlap) and shared groups awaiting
/// round-robin selection.
#[derive(Debug, Clone, Default)]
pub struct TopicMatches {
    pub subscribers: Vec<(String, SubscriptionOptions)>,
    pub shared: Vec<SharedMatch>,
}

/// Per-client subscription index.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Idempotent per (client, filter); returns the options it replaced.
    async fn subscribe(
        &self,
        client_id: &str,
        subscription: ClientSubscription,
    ) -> Result<Option<SubscriptionOptions>, StoreError>;

    async fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<bool, StoreError>;

    async fn unsubscribe_all(&self, client_id: &str) -> Result<(), StoreError>;

    /// Every stored subscription whose filter matches `topic`.
    async fn matches(&self, topic: &str) -> Result<TopicMatches, StoreError>;

    async fn client_subscriptions(
        &self,
        client_id: &str,
    ) -> Result<Vec<ClientSubscription>, StoreError>;

    fn shutdown(&self);
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    /// `+` child.
    single: Option<Box<TrieNode>>,
    /// Subscriptions terminating here with `#`.
    multi: HashMap<String, SubscriptionOptions>,
    /// Subscriptions terminating exactly here.
    leaf: HashMap<String, SubscriptionOptions>,
}

impl TrieNode {
    fn insert(
        &mut self,
        mut levels: std::str::Split<'_, char>,
        client_id: &str,
        options: SubscriptionOptions,
    ) -> Option<SubscriptionOptions> {
        match levels.next() {
            None => self.leaf.insert(client_id.to_string(), options),
            Some("#") => self.multi.insert(client_id.to_string(), options),
            Some("+") => self
                .single
                .get_or_insert_with(Box::default)
                .insert(levels, client_id, options),
            Some(level) => self
                .children
                .entry(level.to_string())
                .or_default()
                .insert(levels, client_id, options),
        }
    }

    fn remove(&mut self, mut levels: std::str::Split<'_, char>, client_id: &str) -> bool {
        match levels.next() {
            None => self.leaf.remove(client_id).is_some(),
            Some("#") => self.multi.remove(client_id).is_some(),
            Some("+") => self
                .single
                .as_mut()
                .is_some_and(|child| child.remove(levels, client_id)),
            Some(level) => self
                .children
                .get_mut(level)
                .is_some_and(|child| child.remove(levels, client_id)),
        }
    }

    fn collect<'a>(
        &'a self,
        levels: &[&str],
        out: &mut Vec<(&'a String, &'a SubscriptionOptions)>,
    ) {
        out.extend(self.multi.iter());
        match levels.split_first() {
            None => out.extend(self.leaf.iter()),
            Some((first, rest)) => {
                if let Some(child) = self.children.get(*first) {
                    child.collect(rest, out);
                }
                if let Some(child) = &self.single {
                    child.collect(rest, out);
                }
            }
        }
    }
}

/// In-memory trie-backed subscription store.
pub struct MemorySubscriptionStore {
    inner: RwLock<Inner>,
    closed: AtomicBool,
}

#[derive(Default)]
struct Inner {
    trie: TrieNode,
    /// `inner filter → group → client → options`.
    shared: HashMap<String, HashMap<String, HashMap<String, SubscriptionOptions>>>,
    /// `client → original filters`, for unsubscribe_all and enumeration.
    by_client: HashMap<String, HashMap<String, ClientSubscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(StoreError::Shutdown);
        }
        Ok(())
    }

    fn remove_entry(inner: &mut Inner, client_id: &str, sub: &ClientSubscription) {
        match &sub.shared_group {
            Some(group) => {
                let filter = sub.match_filter().to_string();
                if let Some(groups) = inner.shared.get_mut(&filter) {
                    if let Some(members) = groups.get_mut(group) {
                        members.remove(client_id);
                        if members.is_empty() {
                            groups.remove(group);
                        }
                    }
                    if groups.is_empty() {
                        inner.shared.remove(&filter);
                    }
                }
            }
            None => {
                inner.trie.remove(sub.filter.split('/'), client_id);
            }
        }
    }
}

impl Default for MemorySubscriptionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn subscribe(
        &self,
        client_id: &str,
        subscription: ClientSubscription,
    ) -> Result<Option<SubscriptionOptions>, StoreError> {
        self.guard()?;
        let mut inner = self.inner.write();
        let previous = match &subscription.shared_group {
            Some(group) => inner
                .shared
                .entry(subscription.match_filter().to_string())
                .or_default()
                .entry(group.clone())
                .or_default()
                .insert(client_id.to_string(), subscription.options),
            None => inner.trie.insert(
                subscription.filter.split('/'),
                client_id,
                subscription.options,
            ),
        };
        inner
            .by_client
            .entry(client_id.to_string())
            .or_default()
            .insert(subscription.filter.clone(), subscription);
        Ok(previous)
    }

    async fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<bool, StoreError> {
        self.guard()?;
        let mut inner = self.inner.write();
        let Some(sub) = inner
            .by_client
            .get_mut(client_id)
            .and_then(|subs| subs.remove(filter))
        else {
            return Ok(false);
        };
        Self::remove_entry(&mut inner, client_id, &sub);
        Ok(true)
    }

    async fn unsubscribe_all(&self, client_id: &str) -> Result<(), StoreError> {
        self.guard()?;
        let mut inner = self.inner.write();
        let Some(subs) = inner.by_client.remove(client_id) else {
            return Ok(());
        };
        for sub in subs.values() {
            Self::remove_entry(&mut inner, client_id, sub);
        }
        Ok(())
    }

    async fn matches(&self, topic_name: &str) -> Result<TopicMatches, StoreError> {
        self.guard()?;
        let inner = self.inner.read();
        let mut out = TopicMatches::default();

        let levels: Vec<&str> = topic_name.split('/').collect();
        if topic_name.starts_with('$') {
            // `$`-rooted topics only reach filters with a literal first
            // level; descend past the root by hand to skip the wildcard
            // slots.
            if let Some(child) = inner.trie.children.get(levels[0]) {
                let mut found = Vec::new();
                child.collect(&levels[1..], &mut found);
                out.subscribers = found
                    .into_iter()
                    .map(|(c, o)| (c.clone(), *o))
                    .collect();
            }
        } else {
            let mut found = Vec::new();
            inner.trie.collect(&levels, &mut found);
            out.subscribers = found.into_iter().map(|(c, o)| (c.clone(), *o)).collect();
        }

        for (filter, groups) in &inner.shared {
            if !topic::matches(filter, topic_name) {
                continue;
            }
            for (group, members) in groups {
                out.shared.push(SharedMatch {
                    filter: filter.clone(),
                    group: group.clone(),
                    members: members.iter().map(|(c, o)| (c.clone(), *o)).collect(),
                });
            }
        }
        Ok(out)
    }

    async fn client_subscriptions(
        &self,
        client_id: &str,
    ) -> Result<Vec<ClientSubscription>, StoreError> {
        self.guard()?;
        let inner = self.inner.read();
        Ok(inner
            .by_client
            .get(client_id)
            .map(|subs| subs.values().cloned().collect())
            .unwrap_or_default())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(filter: &str, qos: QoS) -> ClientSubscription {
        let shared_group = match topic::SharedFilter::parse(filter) {
            Some(Ok(shared)) => Some(shared.group.to_string()),
            _ => None,
        };
        ClientSubscription {
            filter: filter.to_string(),
            shared_group,
            options: SubscriptionOptions {
                max_qos: qos,
                ..Default::default()
            },
        }
    }

    async fn store_with(entries: &[(&str, &str)]) -> MemorySubscriptionStore {
        let store = MemorySubscriptionStore::new();
        for (client, filter) in entries {
            store
                .subscribe(client, sub(filter, QoS::AtLeastOnce))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn overlapping_filters_all_match() {
        let store = store_with(&[
            ("a", "sensors/temp"),
            ("b", "sensors/+"),
            ("c", "sensors/#"),
            ("d", "other/#"),
        ])
        .await;
        let matches = store.matches("sensors/temp").await.unwrap();
        let mut clients: Vec<&str> = matches
            .subscribers
            .iter()
            .map(|(c, _)| c.as_str())
            .collect();
        clients.sort_unstable();
        assert_eq!(clients, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn resubscribe_replaces_options() {
        let store = MemorySubscriptionStore::new();
        assert!(store
            .subscribe("a", sub("x", QoS::AtMostOnce))
            .await
            .unwrap()
            .is_none());
        let previous = store
            .subscribe("a", sub("x", QoS::ExactlyOnce))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(previous.max_qos, QoS::AtMostOnce);
        let matches = store.matches("x").await.unwrap();
        assert_eq!(matches.subscribers.len(), 1);
        assert_eq!(matches.subscribers[0].1.max_qos, QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn dollar_topics_need_literal_root() {
        let store = store_with(&[("a", "#"), ("b", "+/x"), ("c", "$SYS/#")]).await;
        let matches = store.matches("$SYS/x").await.unwrap();
        let clients: Vec<&str> = matches
            .subscribers
            .iter()
            .map(|(c, _)| c.as_str())
            .collect();
        assert_eq!(clients, ["c"]);
    }

    #[tokio::test]
    async fn shared_groups_bucket_members() {
        let store = store_with(&[
            ("a", "$share/g/foo"),
            ("b", "$share/g/foo"),
            ("c", "$share/h/foo"),
        ])
        .await;
        let matches = store.matches("foo").await.unwrap();
        assert!(matches.subscribers.is_empty());
        assert_eq!(matches.shared.len(), 2);
        let g = matches.shared.iter().find(|m| m.group == "g").unwrap();
        assert_eq!(g.members.len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_both_indexes() {
        let store = store_with(&[("a", "x/y"), ("a", "$share/g/z")]).await;
        store.unsubscribe_all("a").await.unwrap();
        assert!(store.matches("x/y").await.unwrap().subscribers.is_empty());
        assert!(store.matches("z").await.unwrap().shared.is_empty());
        assert!(store.client_subscriptions("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_uses_original_filter_form() {
        let store = store_with(&[("a", "$share/g/z")]).await;
        assert!(store.unsubscribe("a", "$share/g/z").await.unwrap());
        assert!(store.matches("z").await.unwrap().shared.is_empty());
    }
}
