use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    broker::{BrokerAddress, LogCallback, LogEvent, topic_matches},
    envelope::codec::{ContentMode, EncodedMessage},
    pool::ManageConnection,
    transport::{DeliveryStatus, Sender},
};

/// In-process broker for tests and local pipelines.
///
/// Behaves like a topic exchange: every consumer group owns one durable
/// queue, bound to a set of topic patterns (`*` one word, `#` any number of
/// words). A published message is copied into every queue with a matching
/// binding; messages published before any binding exists are only recorded
/// in [`published`](InMemoryBroker::published).
///
/// Deliveries stay unacknowledged until committed. Rejected deliveries go
/// back to the front of their queue, and disposing a client requeues whatever
/// it still held.
///
/// Faults can be injected for every failure path a real broker has: an
/// unreachable broker, a failed or refused publish, retriable and fatal poll
/// errors, and operational log events.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    next_client: AtomicU64,
}

struct State {
    published: Vec<EncodedMessage>,
    groups: HashMap<String, Group>,
    unreachable: bool,
    delivery_status: DeliveryStatus,
    publish_failures: VecDeque<String>,
    connections_opened: usize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            published: Vec::new(),
            groups: HashMap::new(),
            unreachable: false,
            delivery_status: DeliveryStatus::Persisted,
            publish_failures: VecDeque::new(),
            connections_opened: 0,
        }
    }
}

#[derive(Default)]
struct Group {
    bindings: BTreeSet<String>,
    ready: VecDeque<(u64, EncodedMessage)>,
    unacked: HashMap<u64, EncodedMessage>,
    next_tag: u64,
    committed: usize,
    rejected: usize,
    poll_faults: VecDeque<PollFault>,
    log_callbacks: BTreeMap<u64, LogCallback>,
}

/// Failure the next poll of a group reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollFault {
    /// A broker error from the retriable set.
    Retriable(String),
    /// A broker error outside the retriable set.
    Fatal(String),
}

/// Snapshot of one consumer group's queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub bindings: BTreeSet<String>,
    /// Waiting for delivery.
    pub ready: usize,
    /// Delivered, not yet committed or rejected.
    pub unacked: usize,
    pub committed: usize,
    pub rejected: usize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(&self) -> BrokerAddress {
        BrokerAddress::new("InMemory", Some("memory".to_owned()))
    }

    /// Pool manager creating [`InMemorySender`] handles.
    pub fn connector(&self) -> InMemoryConnector {
        InMemoryConnector {
            broker: self.clone(),
            content_mode: ContentMode::Binary,
        }
    }

    /// Route a message to every group with a matching binding.
    pub fn publish(&self, message: EncodedMessage) {
        let mut state = self.inner.state.lock();
        for group in state.groups.values_mut() {
            if group
                .bindings
                .iter()
                .any(|pattern| topic_matches(pattern, &message.topic))
            {
                let tag = group.next_tag;
                group.next_tag += 1;
                group.ready.push_back((tag, message.clone()));
            }
        }
        state.published.push(message);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<EncodedMessage> {
        self.inner.state.lock().published.clone()
    }

    pub fn stats(&self, group: &str) -> GroupStats {
        let state = self.inner.state.lock();
        state
            .groups
            .get(group)
            .map(|g| GroupStats {
                bindings: g.bindings.clone(),
                ready: g.ready.len(),
                unacked: g.unacked.len(),
                committed: g.committed,
                rejected: g.rejected,
            })
            .unwrap_or_default()
    }

    /// Number of sender handles and consumer connections opened so far.
    pub fn connections_opened(&self) -> usize {
        self.inner.state.lock().connections_opened
    }

    /// Make connection attempts fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.state.lock().unreachable = unreachable;
    }

    /// Status reported for subsequent publishes.
    pub fn set_delivery_status(&self, status: DeliveryStatus) {
        self.inner.state.lock().delivery_status = status;
    }

    /// Make the next publish fail with the given reason.
    pub fn fail_next_publish(&self, reason: impl Into<String>) {
        self.inner
            .state
            .lock()
            .publish_failures
            .push_back(reason.into());
    }

    /// Make the next poll of `group` fail.
    pub fn fail_next_poll(&self, group: &str, fault: PollFault) {
        self.inner
            .state
            .lock()
            .groups
            .entry(group.to_owned())
            .or_default()
            .poll_faults
            .push_back(fault);
        self.inner.notify.notify_waiters();
    }

    /// Report an operational event to every client connected for `group`.
    pub fn emit_log(&self, group: &str, event: LogEvent) {
        let callbacks = self
            .inner
            .state
            .lock()
            .groups
            .get(group)
            .map(|g| g.log_callbacks.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub(crate) fn connect(&self) -> Result<(), std::io::Error> {
        let mut state = self.inner.state.lock();
        if state.unreachable {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "in-memory broker unreachable",
            ));
        }
        state.connections_opened += 1;
        Ok(())
    }

    pub(crate) fn declare(&self, group: &str) {
        self.inner
            .state
            .lock()
            .groups
            .entry(group.to_owned())
            .or_default();
    }

    pub(crate) fn bind(&self, group: &str, topics: &[String]) {
        let mut state = self.inner.state.lock();
        let group = state.groups.entry(group.to_owned()).or_default();
        group.bindings.extend(topics.iter().cloned());
    }

    pub(crate) fn unbind(&self, group: &str, topics: &[String]) {
        if let Some(group) = self.inner.state.lock().groups.get_mut(group) {
            for topic in topics {
                group.bindings.remove(topic);
            }
        }
    }

    /// Register a client's log callback; returns the id to unregister it with.
    pub(crate) fn register_log(&self, group: &str, callback: LogCallback) -> u64 {
        let id = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        self.inner
            .state
            .lock()
            .groups
            .entry(group.to_owned())
            .or_default()
            .log_callbacks
            .insert(id, callback);
        id
    }

    pub(crate) fn unregister_log(&self, group: &str, id: u64) {
        if let Some(group) = self.inner.state.lock().groups.get_mut(group) {
            group.log_callbacks.remove(&id);
        }
    }

    /// Take the next ready delivery of `group`, or the next injected fault.
    pub(crate) fn take(&self, group: &str) -> Result<Option<(u64, EncodedMessage)>, PollFault> {
        let mut state = self.inner.state.lock();
        let Some(group) = state.groups.get_mut(group) else {
            return Ok(None);
        };
        if let Some(fault) = group.poll_faults.pop_front() {
            return Err(fault);
        }
        Ok(group.ready.pop_front().inspect(|(tag, message)| {
            group.unacked.insert(*tag, message.clone());
        }))
    }

    /// Wait handle that fires on the next publish or fault injection.
    pub(crate) fn notify(&self) -> &Notify {
        &self.inner.notify
    }

    pub(crate) fn ack(&self, group: &str, tag: u64) -> bool {
        let mut state = self.inner.state.lock();
        match state.groups.get_mut(group) {
            Some(group) => {
                let acked = group.unacked.remove(&tag).is_some();
                if acked {
                    group.committed += 1;
                }
                acked
            }
            None => false,
        }
    }

    pub(crate) fn nack(&self, group: &str, tag: u64) -> bool {
        let mut state = self.inner.state.lock();
        let requeued = match state.groups.get_mut(group) {
            Some(group) => match group.unacked.remove(&tag) {
                Some(message) => {
                    group.rejected += 1;
                    group.ready.push_front((tag, message));
                    true
                }
                None => false,
            },
            None => false,
        };
        drop(state);
        if requeued {
            self.inner.notify.notify_waiters();
        }
        requeued
    }

    /// Requeue the given unacknowledged deliveries.
    pub(crate) fn release(&self, group: &str, tags: impl IntoIterator<Item = u64>) {
        let mut state = self.inner.state.lock();
        if let Some(group) = state.groups.get_mut(group) {
            let mut tags: Vec<u64> = tags.into_iter().collect();
            tags.sort_unstable();
            for tag in tags.into_iter().rev() {
                if let Some(message) = group.unacked.remove(&tag) {
                    group.ready.push_front((tag, message));
                }
            }
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }

    fn publish_outcome(&self) -> Result<DeliveryStatus, std::io::Error> {
        let mut state = self.inner.state.lock();
        match state.publish_failures.pop_front() {
            Some(reason) => Err(std::io::Error::other(reason)),
            None => Ok(state.delivery_status),
        }
    }
}

/// Pool manager for [`InMemorySender`] handles.
#[derive(Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    content_mode: ContentMode,
}

impl InMemoryConnector {
    /// Encode in the given mode instead of binary.
    pub fn with_content_mode(mut self, content_mode: ContentMode) -> Self {
        self.content_mode = content_mode;
        self
    }
}

#[async_trait::async_trait]
impl ManageConnection for InMemoryConnector {
    type Connection = InMemorySender;
    type Error = std::io::Error;

    fn broker_address(&self) -> BrokerAddress {
        self.broker.address()
    }

    async fn connect(&self) -> Result<InMemorySender, std::io::Error> {
        self.broker.connect()?;
        Ok(InMemorySender {
            broker: self.broker.clone(),
            content_mode: self.content_mode,
        })
    }
}

/// Sender handle of the in-memory broker.
pub struct InMemorySender {
    broker: InMemoryBroker,
    content_mode: ContentMode,
}

#[async_trait::async_trait]
impl Sender for InMemorySender {
    type Error = std::io::Error;

    fn content_mode(&self) -> ContentMode {
        self.content_mode
    }

    #[tracing::instrument(skip_all, fields(topic = %message.topic))]
    async fn publish(&mut self, message: EncodedMessage) -> Result<DeliveryStatus, Self::Error> {
        let status = self.broker.publish_outcome()?;
        if status.is_success() {
            self.broker.publish(message);
            tracing::debug!("Message sent to in-memory broker");
        }
        Ok(status)
    }
}
