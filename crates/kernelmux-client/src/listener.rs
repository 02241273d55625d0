//! Listener registration and inbound fan-out.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use kernelmux_wire::{Channel, RawMessage};
use tracing::{trace, warn};

use crate::config::FilterConfig;
use crate::error::{ClientError, Result};

/// `(msg_type, channel)` pair used by listener filters.
pub type MsgTypeKey = (String, Channel);

/// Outcome of a listener callback.
pub type ListenerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives inbound kernel messages.
///
/// Called on the connection task, so implementations should hand heavy work
/// off rather than block. Errors and panics are contained and logged; they
/// never reach other listeners or the connection.
pub trait Listener: Send + Sync {
    fn on_message(&self, channel: Channel, message: &RawMessage) -> ListenerResult;
}

impl<F> Listener for F
where
    F: Fn(Channel, &RawMessage) -> ListenerResult + Send + Sync,
{
    fn on_message(&self, channel: Channel, message: &RawMessage) -> ListenerResult {
        self(channel, message)
    }
}

/// Which `(msg_type, channel)` pairs a listener receives.
///
/// Either an inclusion set, an exclusion set, or neither. An empty set is the
/// same as no set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    include: Option<HashSet<MsgTypeKey>>,
    exclude: Option<HashSet<MsgTypeKey>>,
}

impl MessageFilter {
    /// Receive everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a filter from optional inclusion and exclusion lists.
    pub fn new(
        msg_types: impl IntoIterator<Item = MsgTypeKey>,
        exclude_msg_types: impl IntoIterator<Item = MsgTypeKey>,
    ) -> Result<Self> {
        let include = non_empty(msg_types);
        let exclude = non_empty(exclude_msg_types);
        if include.is_some() && exclude.is_some() {
            return Err(ClientError::FilterConflict);
        }
        Ok(Self { include, exclude })
    }

    /// Receive only the listed pairs.
    pub fn only(msg_types: impl IntoIterator<Item = MsgTypeKey>) -> Self {
        Self {
            include: non_empty(msg_types),
            exclude: None,
        }
    }

    /// Receive everything except the listed pairs.
    pub fn except(exclude_msg_types: impl IntoIterator<Item = MsgTypeKey>) -> Self {
        Self {
            include: None,
            exclude: non_empty(exclude_msg_types),
        }
    }

    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        Self::new(
            config.msg_types.iter().cloned(),
            config.exclude_msg_types.iter().cloned(),
        )
    }

    pub fn accepts(&self, key: &MsgTypeKey) -> bool {
        if let Some(include) = &self.include {
            if !include.contains(key) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.contains(key) {
                return false;
            }
        }
        true
    }
}

fn non_empty(keys: impl IntoIterator<Item = MsgTypeKey>) -> Option<HashSet<MsgTypeKey>> {
    let set: HashSet<MsgTypeKey> = keys.into_iter().collect();
    (!set.is_empty()).then_some(set)
}

struct ListenerEntry {
    listener: Arc<dyn Listener>,
    filter: MessageFilter,
}

/// Counts from one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Registered listeners, in registration order.
///
/// Registration swaps in a new list; dispatch works on whichever list was
/// current when the message arrived, so registering from inside a callback
/// is safe and takes effect from the next message.
pub struct ListenerRegistry {
    entries: ArcSwap<Vec<Arc<ListenerEntry>>>,
    failures: AtomicU64,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .field("failures", &self.failures())
            .finish()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            failures: AtomicU64::new(0),
        }
    }

    /// Register `listener`, or replace its filter if already registered.
    pub fn add(&self, listener: Arc<dyn Listener>, filter: MessageFilter) {
        let entry = Arc::new(ListenerEntry { listener, filter });
        self.entries.rcu(|current| {
            let mut next: Vec<Arc<ListenerEntry>> = current.as_ref().clone();
            match next
                .iter()
                .position(|e| same_listener(&e.listener, &entry.listener))
            {
                Some(index) => next[index] = Arc::clone(&entry),
                None => next.push(Arc::clone(&entry)),
            }
            next
        });
    }

    /// Register with a filter built from inclusion/exclusion lists.
    pub fn add_filtered(
        &self,
        listener: Arc<dyn Listener>,
        msg_types: impl IntoIterator<Item = MsgTypeKey>,
        exclude_msg_types: impl IntoIterator<Item = MsgTypeKey>,
    ) -> Result<()> {
        let filter = MessageFilter::new(msg_types, exclude_msg_types)?;
        self.add(listener, filter);
        Ok(())
    }

    /// Unregister `listener`. Returns whether it was registered.
    pub fn remove(&self, listener: &Arc<dyn Listener>) -> bool {
        let previous = self.entries.rcu(|current| {
            current
                .iter()
                .filter(|e| !same_listener(&e.listener, listener))
                .cloned()
                .collect::<Vec<_>>()
        });
        previous
            .iter()
            .any(|e| same_listener(&e.listener, listener))
    }

    pub fn contains(&self, listener: &Arc<dyn Listener>) -> bool {
        self.entries
            .load()
            .iter()
            .any(|e| same_listener(&e.listener, listener))
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Total listener errors and panics since creation.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deliver `message` to every listener whose filter accepts it.
    pub fn dispatch(&self, channel: Channel, message: &RawMessage) -> DispatchReport {
        let mut report = DispatchReport::default();
        if channel == Channel::Heartbeat {
            return report;
        }
        let snapshot = self.entries.load_full();
        if snapshot.is_empty() {
            return report;
        }

        let key: MsgTypeKey = (message.msg_type().unwrap_or_default(), channel);
        for entry in snapshot.iter() {
            if !entry.filter.accepts(&key) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                entry.listener.on_message(channel, message)
            }));
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(%channel, msg_type = %key.0, error = %err, "listener failed");
                }
                Err(panic) => {
                    report.failed += 1;
                    warn!(
                        %channel,
                        msg_type = %key.0,
                        panic = panic_message(panic.as_ref()),
                        "listener panicked"
                    );
                }
            }
        }
        if report.failed > 0 {
            self.failures
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        trace!(
            %channel,
            msg_type = %key.0,
            delivered = report.delivered,
            "dispatched inbound message"
        );
        report
    }
}

fn same_listener(a: &Arc<dyn Listener>, b: &Arc<dyn Listener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
