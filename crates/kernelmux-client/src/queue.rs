//! Requests waiting for the connection to become ready.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kernelmux_wire::{Channel, Envelope, RawMessage};
use tracing::warn;

use crate::error::{ClientError, Result};

/// Notified when the queue crosses its high-water mark.
pub trait QueueObserver: Send + Sync {
    fn high_water(&self, queued: usize, mark: usize);
}

impl<F> QueueObserver for F
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn high_water(&self, queued: usize, mark: usize) {
        self(queued, mark)
    }
}

/// A request held until it can be written.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub channel: Channel,
    pub message: RawMessage,
    pub enqueued_at: Instant,
    seq: i64,
}

impl QueuedMessage {
    pub fn new(channel: Channel, message: RawMessage) -> Self {
        Self {
            channel,
            message,
            enqueued_at: Instant::now(),
            seq: 0,
        }
    }

    /// A framed copy for writing. The entry stays intact so a failed write
    /// can put it back.
    pub fn envelope(&self) -> Envelope {
        Envelope::new(self.channel, self.message.clone())
    }
}

/// Per-channel FIFO queues with one global ordering.
///
/// Every entry gets a sequence number on entry; [`pop_next`](Self::pop_next)
/// always takes the lowest head across channels, so draining replays requests
/// in exactly the order they were accepted. Entries returned with
/// [`requeue_front`](Self::requeue_front) are numbered below everything
/// already queued.
pub struct OutboundQueue {
    lanes: BTreeMap<Channel, VecDeque<QueuedMessage>>,
    len: usize,
    capacity: usize,
    high_water_mark: usize,
    above_mark: bool,
    next_back: i64,
    next_front: i64,
    observer: Option<Arc<dyn QueueObserver>>,
}

impl fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("high_water_mark", &self.high_water_mark)
            .field("above_mark", &self.above_mark)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl OutboundQueue {
    pub fn new(capacity: usize, high_water_mark: usize) -> Self {
        Self {
            lanes: BTreeMap::new(),
            len: 0,
            capacity,
            high_water_mark,
            above_mark: false,
            next_back: 0,
            next_front: -1,
            observer: None,
        }
    }

    pub fn set_observer(&mut self, observer: Option<Arc<dyn QueueObserver>>) {
        self.observer = observer;
    }

    /// Append a request. Fails with [`ClientError::QueueFull`] at capacity.
    pub fn enqueue(&mut self, channel: Channel, message: RawMessage) -> Result<()> {
        self.push(QueuedMessage::new(channel, message))
    }

    /// Append an already-built entry, keeping its enqueue time.
    pub fn push(&mut self, mut entry: QueuedMessage) -> Result<()> {
        if self.len >= self.capacity {
            return Err(ClientError::QueueFull {
                capacity: self.capacity,
            });
        }
        entry.seq = self.next_back;
        self.next_back += 1;
        self.lanes.entry(entry.channel).or_default().push_back(entry);
        self.len += 1;
        self.check_high_water();
        Ok(())
    }

    /// Put entries back ahead of everything queued, keeping their order.
    ///
    /// These were accepted earlier, so capacity is not enforced.
    pub fn requeue_front(&mut self, entries: Vec<QueuedMessage>) {
        for mut entry in entries.into_iter().rev() {
            entry.seq = self.next_front;
            self.next_front -= 1;
            self.lanes
                .entry(entry.channel)
                .or_default()
                .push_front(entry);
            self.len += 1;
        }
        self.check_high_water();
    }

    /// Remove the oldest entry across all channels.
    pub fn pop_next(&mut self) -> Option<QueuedMessage> {
        let channel = self
            .lanes
            .iter()
            .filter_map(|(channel, lane)| lane.front().map(|head| (head.seq, *channel)))
            .min()
            .map(|(_, channel)| channel)?;
        let entry = self.lanes.get_mut(&channel)?.pop_front()?;
        self.len -= 1;
        if self.len < self.high_water_mark {
            self.above_mark = false;
        }
        Some(entry)
    }

    /// Remove everything, oldest first.
    pub fn drain_all(&mut self) -> Vec<QueuedMessage> {
        let mut drained = Vec::with_capacity(self.len);
        while let Some(entry) = self.pop_next() {
            drained.push(entry);
        }
        drained
    }

    /// Discard everything. Returns how many entries were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len;
        self.lanes.clear();
        self.len = 0;
        self.above_mark = false;
        dropped
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len_for(&self, channel: Channel) -> usize {
        self.lanes.get(&channel).map_or(0, VecDeque::len)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// How long the oldest queued entry has been waiting.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.lanes
            .values()
            .filter_map(VecDeque::front)
            .map(|entry| entry.enqueued_at)
            .min()
            .map(|oldest| oldest.elapsed())
    }

    fn check_high_water(&mut self) {
        if self.high_water_mark == 0 || self.above_mark || self.len < self.high_water_mark {
            return;
        }
        self.above_mark = true;
        warn!(
            queued = self.len,
            high_water_mark = self.high_water_mark,
            capacity = self.capacity,
            "outbound queue reached high-water mark"
        );
        if let Some(observer) = &self.observer {
            observer.high_water(self.len, self.high_water_mark);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;

    fn msg(tag: &'static str) -> RawMessage {
        RawMessage::new(vec![Bytes::from_static(tag.as_bytes())])
    }

    fn tags(entries: &[QueuedMessage]) -> Vec<&[u8]> {
        entries
            .iter()
            .map(|e| e.message.parts()[0].as_ref())
            .collect()
    }

    #[test]
    fn drains_in_enqueue_order_across_channels() {
        let mut queue = OutboundQueue::new(10, 0);
        queue.enqueue(Channel::Shell, msg("m1")).unwrap();
        queue.enqueue(Channel::Control, msg("m2")).unwrap();
        queue.enqueue(Channel::Shell, msg("m3")).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.len_for(Channel::Shell), 2);

        let drained = queue.drain_all();
        assert_eq!(tags(&drained), vec![&b"m1"[..], b"m2", b"m3"]);
        assert_eq!(
            drained.iter().map(|e| e.channel).collect::<Vec<_>>(),
            vec![Channel::Shell, Channel::Control, Channel::Shell]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn rejects_when_full() {
        let mut queue = OutboundQueue::new(2, 0);
        queue.enqueue(Channel::Shell, msg("a")).unwrap();
        queue.enqueue(Channel::Shell, msg("b")).unwrap();
        assert_eq!(
            queue.enqueue(Channel::Shell, msg("c")),
            Err(ClientError::QueueFull { capacity: 2 })
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn requeued_entries_go_first_in_original_order() {
        let mut queue = OutboundQueue::new(10, 0);
        queue.enqueue(Channel::Shell, msg("later")).unwrap();

        let returned = vec![
            QueuedMessage::new(Channel::Control, msg("r1")),
            QueuedMessage::new(Channel::Shell, msg("r2")),
        ];
        queue.requeue_front(returned);

        let drained = queue.drain_all();
        assert_eq!(tags(&drained), vec![&b"r1"[..], b"r2", b"later"]);
    }

    #[test]
    fn high_water_fires_once_per_crossing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        let mut queue = OutboundQueue::new(10, 2);
        queue.set_observer(Some(Arc::new(move |queued: usize, mark: usize| {
            assert!(queued >= mark);
            observed.fetch_add(1, Ordering::SeqCst);
        })));

        queue.enqueue(Channel::Shell, msg("a")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        queue.enqueue(Channel::Shell, msg("b")).unwrap();
        queue.enqueue(Channel::Shell, msg("c")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        queue.drain_all();
        queue.enqueue(Channel::Shell, msg("d")).unwrap();
        queue.enqueue(Channel::Shell, msg("e")).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_and_oldest_age() {
        let mut queue = OutboundQueue::new(10, 0);
        assert!(queue.oldest_age().is_none());
        queue.enqueue(Channel::Stdin, msg("a")).unwrap();
        assert!(queue.oldest_age().is_some());
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
        assert!(queue.pop_next().is_none());
    }
}
