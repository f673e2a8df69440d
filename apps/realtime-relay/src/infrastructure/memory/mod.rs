//! In-memory upstream store.
//!
//! Implements the upstream port without a network. Used by tests and for
//! local development; supports failure injection and counts every command it
//! receives.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::application::ports::{
    MessageStream, UpstreamConnector, UpstreamError, UpstreamHandle, UpstreamMessage,
    UpstreamStore,
};
use crate::domain::clock::{SharedClock, duration_millis, system_clock};

const PUBSUB_CAPACITY: usize = 1_024;

#[derive(Debug, Default)]
struct Data {
    strings: HashMap<String, (String, Option<u64>)>,
    lists: HashMap<String, VecDeque<String>>,
    sorted: HashMap<String, HashMap<String, u64>>,
}

/// In-memory implementation of [`UpstreamStore`].
#[derive(Debug)]
pub struct MemoryStore {
    clock: SharedClock,
    data: Mutex<Data>,
    pubsub: RwLock<broadcast::Sender<UpstreamMessage>>,
    failure: RwLock<Option<UpstreamError>>,
    one_shot_failures: Mutex<HashMap<&'static str, UpstreamError>>,
    calls: AtomicU64,
    command_calls: Mutex<HashMap<&'static str, u64>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create an empty store on a specific clock.
    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        let (pubsub, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            clock,
            data: Mutex::new(Data::default()),
            pubsub: RwLock::new(pubsub),
            failure: RwLock::new(None),
            one_shot_failures: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
            command_calls: Mutex::new(HashMap::new()),
        }
    }

    /// Make every subsequent command fail with `error`, or recover with `None`.
    pub fn fail_with(&self, error: Option<UpstreamError>) {
        *self.failure.write() = error;
    }

    /// Make the next `command` fail with `error`; later ones succeed.
    pub fn fail_next(&self, command: &'static str, error: UpstreamError) {
        self.one_shot_failures.lock().insert(command, error);
    }

    /// Commands received since creation.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Commands of one kind received since creation.
    #[must_use]
    pub fn command_count(&self, command: &str) -> u64 {
        self.command_calls
            .lock()
            .get(command)
            .copied()
            .unwrap_or(0)
    }

    /// End every open subscription stream.
    pub fn disconnect_subscribers(&self) {
        let (pubsub, _) = broadcast::channel(PUBSUB_CAPACITY);
        *self.pubsub.write() = pubsub;
    }

    /// Number of open subscription streams.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.pubsub.read().receiver_count()
    }

    /// Read a key without counting a command.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = self.clock.now_millis();
        self.data
            .lock()
            .strings
            .get(key)
            .filter(|(_, expires)| expires.is_none_or(|at| now < at))
            .map(|(value, _)| value.clone())
    }

    /// Write a key without counting a command.
    pub fn seed(&self, key: &str, value: &str) {
        self.data
            .lock()
            .strings
            .insert(key.to_string(), (value.to_string(), None));
    }

    fn enter(&self, command: &'static str) -> Result<(), UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.command_calls.lock().entry(command).or_insert(0) += 1;
        if let Some(error) = self.one_shot_failures.lock().remove(command) {
            return Err(error);
        }
        self.failure.read().clone().map_or(Ok(()), Err)
    }

    fn read_string(&self, data: &mut Data, key: &str) -> Option<String> {
        let now = self.clock.now_millis();
        let expired = match data.strings.get(key) {
            Some((_, Some(expires_at))) => now >= *expires_at,
            Some((_, None)) => false,
            None => return None,
        };
        if expired {
            data.strings.remove(key);
            return None;
        }
        data.strings.get(key).map(|(value, _)| value.clone())
    }
}

#[async_trait]
impl UpstreamStore for MemoryStore {
    async fn ping(&self) -> Result<(), UpstreamError> {
        self.enter("ping")
    }

    async fn get(&self, key: &str) -> Result<Option<String>, UpstreamError> {
        self.enter("get")?;
        let mut data = self.data.lock();
        Ok(self.read_string(&mut data, key))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), UpstreamError> {
        self.enter("set")?;
        let expires_at = ttl.map(|ttl| {
            self.clock
                .now_millis()
                .saturating_add(duration_millis(ttl))
        });
        self.data
            .lock()
            .strings
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, UpstreamError> {
        self.enter("mget")?;
        let mut data = self.data.lock();
        Ok(keys
            .iter()
            .map(|key| self.read_string(&mut data, key))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), UpstreamError> {
        self.enter("delete")?;
        let mut data = self.data.lock();
        data.strings.remove(key);
        data.lists.remove(key);
        data.sorted.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), UpstreamError> {
        self.enter("publish")?;
        let _ = self.pubsub.read().send(UpstreamMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<MessageStream, UpstreamError> {
        self.enter("subscribe")?;
        let wanted: HashSet<String> = channels.iter().map(|c| (*c).to_string()).collect();
        let receiver = self.pubsub.read().subscribe();

        let stream = BroadcastStream::new(receiver).filter_map(move |message| {
            let keep = match message {
                Ok(message) if wanted.contains(&message.channel) => Some(message),
                _ => None,
            };
            futures::future::ready(keep)
        });
        Ok(stream.boxed())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<(), UpstreamError> {
        self.enter("list_push")?;
        self.data
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_len(&self, key: &str) -> Result<usize, UpstreamError> {
        self.enter("list_len")?;
        Ok(self.data.lock().lists.get(key).map_or(0, VecDeque::len))
    }

    async fn list_pop_to_sorted(
        &self,
        list: &str,
        claims: &str,
        claimed_at_ms: u64,
    ) -> Result<Option<String>, UpstreamError> {
        self.enter("list_pop_to_sorted")?;
        let mut data = self.data.lock();
        let Some(id) = data.lists.get_mut(list).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        data.sorted
            .entry(claims.to_string())
            .or_default()
            .insert(id.clone(), claimed_at_ms);
        Ok(Some(id))
    }

    async fn sorted_members_upto(
        &self,
        key: &str,
        max_score: u64,
    ) -> Result<Vec<String>, UpstreamError> {
        self.enter("sorted_members_upto")?;
        let data = self.data.lock();
        let mut members: Vec<(u64, String)> = data
            .sorted
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score <= max_score)
                    .map(|(member, score)| (*score, member.clone()))
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        Ok(members.into_iter().map(|(_, member)| member).collect())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<(), UpstreamError> {
        self.enter("sorted_remove")?;
        if let Some(set) = self.data.lock().sorted.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, UpstreamError> {
        self.enter("sorted_len")?;
        Ok(self.data.lock().sorted.get(key).map_or(0, HashMap::len))
    }
}

/// Connector handing out a shared [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    refusing: AtomicBool,
    connects: AtomicUsize,
    connect_delay: Mutex<Option<Duration>>,
}

impl MemoryConnector {
    /// Create a connector for `store`.
    #[must_use]
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            refusing: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            connect_delay: Mutex::new(None),
        }
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    /// Refuse (or accept again) new connections.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Delay every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    /// Connect calls since creation.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamConnector for MemoryConnector {
    async fn connect(&self) -> Result<UpstreamHandle, UpstreamError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.refusing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Connection("connection refused".to_string()));
        }
        let handle: UpstreamHandle = self.store.clone();
        Ok(handle)
    }

    fn describe(&self) -> String {
        "memory://local".to_string()
    }
}
