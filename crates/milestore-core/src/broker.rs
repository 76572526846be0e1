//! Append notifications.
//!
//! Committed events reach two audiences:
//!
//! - In-process subscribers registered with [`Broker::subscribe`] receive
//!   full [`Event`]s over bounded channels. A subscriber whose queue fills
//!   up is dropped and its [`Subscription`] reports it as lagged; it should
//!   re-read from the log and subscribe again.
//! - Other processes follow `feed.jsonl`, a shared append-only file of
//!   compact [`Notice`] lines, through a [`FeedCursor`].
//!
//! The feed is bounded. Once `feed.jsonl` reaches the configured size the
//! next append renames it to `feed.1.jsonl`, replacing the segment before
//! it, and starts a fresh file. Every segment opens with a
//! `{"feed_generation":N}` header so cursors can tell segments apart. A
//! cursor that finds its generation rotated away entirely resumes at the
//! oldest segment left and reports [`FeedCursor::missed_rotation`].
//!
//! Publishing never fails a commit: feed write errors are logged.

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{IoContext, StoreError};
use crate::event::{Event, EventKind};
use crate::lock::StoreLock;
use crate::model::WorkUnitId;

pub const FEED_FILE: &str = "feed.jsonl";
const FEED_LOCK_FILE: &str = "feed.lock";
const FEED_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const HEADER_PREFIX: &[u8] = b"{\"feed_generation\":";

/// Size past which `feed.jsonl` is rotated, unless configured otherwise.
pub const DEFAULT_FEED_MAX_BYTES: u64 = 4 * 1024 * 1024;

/// Queue depth for subscribers that do not ask for one.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// One committed event, as written to the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub work_unit_id: WorkUnitId,
    pub sequence: u64,
    pub kind: EventKind,
    pub writer_id: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Event> for Notice {
    fn from(event: &Event) -> Self {
        Self {
            work_unit_id: event.work_unit_id.clone(),
            sequence: event.sequence,
            kind: event.kind,
            writer_id: event.writer_id.clone(),
            timestamp: event.timestamp,
        }
    }
}

/// Which events a subscriber wants. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub work_unit: Option<WorkUnitId>,
    pub kinds: BTreeSet<EventKind>,
}

impl SubscriptionFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn unit(id: WorkUnitId) -> Self {
        Self {
            work_unit: Some(id),
            kinds: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    #[must_use]
    pub fn matches(&self, work_unit: &WorkUnitId, kind: EventKind) -> bool {
        self.work_unit.as_ref().is_none_or(|id| id == work_unit)
            && (self.kinds.is_empty() || self.kinds.contains(&kind))
    }
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription {
    receiver: Receiver<Event>,
    lagged: Arc<AtomicBool>,
}

impl Subscription {
    /// Next event without blocking.
    #[must_use]
    pub fn try_next(&self) -> Option<Event> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Next event, waiting up to `timeout`.
    #[must_use]
    pub fn next_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything queued right now.
    #[must_use]
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }

    /// Whether the broker dropped this subscriber for falling behind.
    #[must_use]
    pub fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct Subscriber {
    filter: SubscriptionFilter,
    sender: Sender<Event>,
    lagged: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_id: u64,
    subscribers: BTreeMap<u64, Subscriber>,
}

/// Fan-out of committed events.
#[derive(Debug)]
pub struct Broker {
    feed_path: PathBuf,
    lock_path: PathBuf,
    max_feed_bytes: u64,
    state: Mutex<BrokerState>,
}

impl Broker {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            feed_path: root.join(FEED_FILE),
            lock_path: root.join(FEED_LOCK_FILE),
            max_feed_bytes: DEFAULT_FEED_MAX_BYTES,
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Rotate `feed.jsonl` once it holds at least `bytes` bytes.
    #[must_use]
    pub fn with_feed_limit(mut self, bytes: u64) -> Self {
        self.max_feed_bytes = bytes.max(1);
        self
    }

    #[must_use]
    pub fn feed_path(&self) -> &Path {
        &self.feed_path
    }

    #[must_use]
    pub fn subscribe(&self, filter: SubscriptionFilter, capacity: usize) -> Subscription {
        let (sender, receiver) = channel::bounded(capacity.max(1));
        let lagged = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(
            id,
            Subscriber {
                filter,
                sender,
                lagged: Arc::clone(&lagged),
            },
        );
        Subscription { receiver, lagged }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }

    /// Deliver committed `events` to subscribers and the feed.
    pub fn publish(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        self.notify_subscribers(events);
        if let Err(err) = self.append_feed(events) {
            tracing::warn!(path = %self.feed_path.display(), error = %err, "feed append failed");
        }
    }

    fn notify_subscribers(&self, events: &[Event]) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = Vec::new();
        for (id, subscriber) in &state.subscribers {
            for event in events {
                if !subscriber.filter.matches(&event.work_unit_id, event.kind) {
                    continue;
                }
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        subscriber.lagged.store(true, Ordering::Release);
                        tracing::warn!(subscriber = id, "subscriber lagged, dropping it");
                        dropped.push(*id);
                        break;
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        dropped.push(*id);
                        break;
                    }
                }
            }
        }
        for id in dropped {
            state.subscribers.remove(&id);
        }
    }

    fn append_feed(&self, events: &[Event]) -> Result<(), StoreError> {
        let mut lines = String::new();
        for event in events {
            lines.push_str(&serde_json::to_string(&Notice::from(event))?);
            lines.push('\n');
        }

        let _guard = StoreLock::acquire(&self.lock_path, FEED_LOCK_TIMEOUT)?;
        let len = feed_len(&self.feed_path)?;
        let header = if len == 0 {
            let previous = previous_segment(&self.feed_path);
            Some(open_segment(&previous)?.map_or(0, |seg| seg.generation + 1))
        } else if len >= self.max_feed_bytes {
            let generation = open_segment(&self.feed_path)?.map_or(0, |seg| seg.generation);
            let previous = previous_segment(&self.feed_path);
            fs::rename(&self.feed_path, &previous).at(&previous)?;
            tracing::info!(generation = generation + 1, bytes = len, "feed rotated");
            Some(generation + 1)
        } else {
            None
        };

        let mut buf = String::new();
        if let Some(feed_generation) = header {
            buf.push_str(&serde_json::to_string(&SegmentHeader { feed_generation })?);
            buf.push('\n');
        }
        buf.push_str(&lines);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.feed_path)
            .at(&self.feed_path)?;
        file.write_all(buf.as_bytes()).at(&self.feed_path)
    }

    /// Writers that appended within `window`, according to the feed.
    ///
    /// Both segments are scanned; rotation keeps them bounded.
    ///
    /// # Errors
    ///
    /// I/O failures reading the feed.
    pub fn recent_writers(&self, window: Duration) -> Result<BTreeSet<String>, StoreError> {
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w));
        let mut cursor = FeedCursor::from_start(&self.feed_path);
        Ok(cursor
            .poll()?
            .into_iter()
            .filter(|n| since.is_none_or(|since| n.timestamp >= since))
            .map(|n| n.writer_id)
            .collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    feed_generation: u64,
}

/// A resumable position in the feed: segment generation plus byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPosition {
    pub generation: u64,
    pub offset: u64,
}

/// A reading position in the feed.
///
/// Only complete lines are consumed; a line still being appended is picked
/// up by the next [`FeedCursor::poll`].
#[derive(Debug, Clone)]
pub struct FeedCursor {
    path: PathBuf,
    position: Option<FeedPosition>,
    filter: SubscriptionFilter,
    missed_rotation: bool,
}

impl FeedCursor {
    /// Start at the oldest notice still on disk.
    #[must_use]
    pub fn from_start(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            position: None,
            filter: SubscriptionFilter::all(),
            missed_rotation: false,
        }
    }

    /// Start at a previously saved position.
    #[must_use]
    pub fn at(path: &Path, position: FeedPosition) -> Self {
        Self {
            position: Some(position),
            ..Self::from_start(path)
        }
    }

    /// Start after everything already in the feed.
    ///
    /// # Errors
    ///
    /// I/O failures other than a missing feed.
    pub fn from_end(path: &Path) -> Result<Self, StoreError> {
        let position = match open_segment(path)? {
            Some(seg) => FeedPosition {
                generation: seg.generation,
                offset: seg.len,
            },
            None => FeedPosition {
                generation: open_segment(&previous_segment(path))?
                    .map_or(0, |seg| seg.generation + 1),
                offset: 0,
            },
        };
        Ok(Self::at(path, position))
    }

    #[must_use]
    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Position of the next unread line. Persist it to resume later.
    ///
    /// `None` until a cursor started with [`FeedCursor::from_start`] has
    /// seen a segment.
    #[must_use]
    pub const fn position(&self) -> Option<FeedPosition> {
        self.position
    }

    /// Whether notices were lost because the feed rotated past this cursor.
    #[must_use]
    pub const fn missed_rotation(&self) -> bool {
        self.missed_rotation
    }

    /// Read every complete notice appended since the last poll.
    ///
    /// # Errors
    ///
    /// I/O failures, or [`StoreError::Corrupt`] for an unparsable line.
    pub fn poll(&mut self) -> Result<Vec<Notice>, StoreError> {
        let Some(mut current) = open_segment(&self.path)? else {
            return Ok(Vec::new());
        };
        let previous_path = previous_segment(&self.path);
        let mut previous = open_segment(&previous_path)?
            .filter(|seg| seg.generation + 1 == current.generation);
        let mut notices = Vec::new();

        let mut position = match self.position {
            Some(position) => position,
            None => FeedPosition {
                generation: previous.as_ref().map_or(current.generation, |s| s.generation),
                offset: 0,
            },
        };
        if position.generation != current.generation {
            let offset = match previous.as_ref() {
                Some(seg) if seg.generation == position.generation => position.offset,
                _ => {
                    tracing::warn!(
                        path = %self.path.display(),
                        cursor = position.generation,
                        current = current.generation,
                        "feed rotated past cursor, resuming at the oldest segment"
                    );
                    self.missed_rotation = true;
                    0
                }
            };
            if let Some(seg) = previous.as_mut() {
                self.read_lines(seg, &previous_path, offset, &mut notices)?;
            }
            position = FeedPosition {
                generation: current.generation,
                offset: 0,
            };
        }

        position.offset =
            self.read_lines(&mut current, &self.path, position.offset, &mut notices)?;
        self.position = Some(position);
        Ok(notices)
    }

    /// Parse complete lines from `offset` on, returning the new offset.
    fn read_lines(
        &self,
        segment: &mut Segment,
        path: &Path,
        offset: u64,
        notices: &mut Vec<Notice>,
    ) -> Result<u64, StoreError> {
        segment.file.seek(SeekFrom::Start(offset)).at(path)?;
        let mut buf = Vec::new();
        segment.file.read_to_end(&mut buf).at(path)?;
        let Some(last_nl) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(offset);
        };

        for line in buf[..=last_nl].split(|&b| b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) || line.starts_with(HEADER_PREFIX) {
                continue;
            }
            let notice: Notice =
                serde_json::from_slice(line).map_err(|err| StoreError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("feed line at offset {offset}: {err}"),
                })?;
            if self.filter.matches(&notice.work_unit_id, notice.kind) {
                notices.push(notice);
            }
        }
        Ok(offset + last_nl as u64 + 1)
    }
}

/// An open feed segment. Length and generation come from the same handle,
/// so a concurrent rotation cannot mix two segments up.
#[derive(Debug)]
struct Segment {
    file: File,
    generation: u64,
    len: u64,
}

/// Open a segment and read its header. Segments without one are
/// generation 0.
fn open_segment(path: &Path) -> Result<Option<Segment>, StoreError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StoreError::io(path, err)),
    };
    let len = file.metadata().at(path)?.len();
    let mut head = Vec::new();
    Read::by_ref(&mut file).take(64).read_to_end(&mut head).at(path)?;
    let generation = head
        .iter()
        .position(|&b| b == b'\n')
        .filter(|_| head.starts_with(HEADER_PREFIX))
        .and_then(|nl| serde_json::from_slice::<SegmentHeader>(&head[..nl]).ok())
        .map_or(0, |header| header.feed_generation);
    Ok(Some(Segment {
        file,
        generation,
        len,
    }))
}

/// `feed.jsonl` rotates into `feed.1.jsonl`.
fn previous_segment(path: &Path) -> PathBuf {
    path.with_extension("1.jsonl")
}

fn feed_len(path: &Path) -> Result<u64, StoreError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, PhaseCompletedData, PhaseStartedData};
    use tempfile::TempDir;

    fn uid(raw: &str) -> WorkUnitId {
        WorkUnitId::parse(raw).unwrap()
    }

    fn event(unit: &str, seq: u64, payload: EventPayload) -> Event {
        Event {
            sequence: seq,
            timestamp: Utc::now(),
            work_unit_id: uid(unit),
            kind: payload.kind(),
            payload,
            writer_id: format!("writer-{unit}"),
        }
    }

    fn started(unit: &str, seq: u64) -> Event {
        event(
            unit,
            seq,
            EventPayload::PhaseStarted(PhaseStartedData {
                phase: "p".into(),
            }),
        )
    }

    fn completed(unit: &str, seq: u64) -> Event {
        event(
            unit,
            seq,
            EventPayload::PhaseCompleted(PhaseCompletedData {
                phase: "p".into(),
                deliverables: BTreeSet::from(["abc123".to_string()]),
            }),
        )
    }

    #[test]
    fn subscribers_see_only_matching_events() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::new(dir.path());
        let all = broker.subscribe(SubscriptionFilter::all(), 16);
        let only_a = broker.subscribe(SubscriptionFilter::unit(uid("A")), 16);
        let completions = broker.subscribe(
            SubscriptionFilter::all().with_kinds([EventKind::PhaseCompleted]),
            16,
        );

        broker.publish(&[started("A", 1), started("B", 1), completed("B", 2)]);

        assert_eq!(all.drain().len(), 3);
        let a = only_a.drain();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].work_unit_id, uid("A"));
        let c = completions.drain();
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].kind, EventKind::PhaseCompleted);
    }

    #[test]
    fn full_queue_drops_subscriber_and_flags_lag() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::new(dir.path());
        let slow = broker.subscribe(SubscriptionFilter::all(), 1);
        broker.publish(&[started("A", 1), started("A", 2)]);
        assert!(slow.is_lagged());
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::new(dir.path());
        drop(broker.subscribe(SubscriptionFilter::all(), 4));
        broker.publish(&[started("A", 1)]);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[test]
    fn cursor_reads_only_complete_lines_and_resumes() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::new(dir.path());
        let mut cursor = FeedCursor::from_start(broker.feed_path());
        assert!(cursor.poll().unwrap().is_empty());

        broker.publish(&[started("A", 1)]);
        let mut file = OpenOptions::new()
            .append(true)
            .open(broker.feed_path())
            .unwrap();
        file.write_all(b"{\"work_unit_id\":\"A\"").unwrap();

        let first = cursor.poll().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].sequence, 1);
        let saved = cursor.position();
        assert!(cursor.poll().unwrap().is_empty());
        assert_eq!(cursor.position(), saved);
    }

    #[test]
    fn cursor_from_end_skips_history_and_filters() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::new(dir.path());
        broker.publish(&[started("A", 1)]);
        let mut cursor = FeedCursor::from_end(broker.feed_path())
            .unwrap()
            .with_filter(SubscriptionFilter::all().with_kinds([EventKind::PhaseCompleted]));
        broker.publish(&[started("B", 1), completed("B", 2)]);
        let notices = cursor.poll().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].work_unit_id, uid("B"));
    }

    #[test]
    fn recent_writers_come_from_the_feed() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::new(dir.path());
        broker.publish(&[started("A", 1), started("B", 1), started("A", 2)]);
        let writers = broker.recent_writers(Duration::from_secs(60)).unwrap();
        assert_eq!(
            writers,
            BTreeSet::from(["writer-A".to_string(), "writer-B".to_string()])
        );
    }

    #[test]
    fn feed_rotates_and_cursors_cross_the_boundary() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::new(dir.path()).with_feed_limit(1);
        let mut cursor = FeedCursor::from_start(broker.feed_path());

        broker.publish(&[started("A", 1)]);
        assert_eq!(cursor.poll().unwrap()[0].sequence, 1);
        assert_eq!(cursor.position().unwrap().generation, 0);

        broker.publish(&[started("A", 2)]);
        assert!(dir.path().join("feed.1.jsonl").exists());
        let next = cursor.poll().unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].sequence, 2);
        assert_eq!(cursor.position().unwrap().generation, 1);
        assert!(!cursor.missed_rotation());

        let mut resumed = FeedCursor::at(broker.feed_path(), cursor.position().unwrap());
        broker.publish(&[started("A", 3)]);
        let seqs: Vec<u64> = resumed.poll().unwrap().iter().map(|n| n.sequence).collect();
        assert_eq!(seqs, vec![3]);
    }

    #[test]
    fn cursor_left_behind_by_two_rotations_resets_and_flags_it() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::new(dir.path()).with_feed_limit(1);
        let mut cursor = FeedCursor::from_start(broker.feed_path());
        broker.publish(&[started("A", 1)]);
        assert_eq!(cursor.poll().unwrap().len(), 1);

        for seq in 2..=4 {
            broker.publish(&[started("A", seq)]);
        }
        let seqs: Vec<u64> = cursor.poll().unwrap().iter().map(|n| n.sequence).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert!(cursor.missed_rotation());
        assert_eq!(cursor.position().unwrap().generation, 3);
    }

    #[test]
    fn feed_size_stays_bounded_under_steady_appends() {
        let dir = TempDir::new().unwrap();
        let broker = Broker::new(dir.path()).with_feed_limit(512);
        for seq in 1..=200 {
            broker.publish(&[started("A", seq)]);
        }
        let total = feed_len(broker.feed_path()).unwrap()
            + feed_len(&dir.path().join("feed.1.jsonl")).unwrap();
        assert!(total < 2 * 1024, "feed holds {total} bytes");

        let writers = broker.recent_writers(Duration::from_secs(60)).unwrap();
        assert_eq!(writers, BTreeSet::from(["writer-A".to_string()]));
        let mut cursor = FeedCursor::from_end(broker.feed_path()).unwrap();
        broker.publish(&[started("B", 1)]);
        assert_eq!(cursor.poll().unwrap()[0].work_unit_id, uid("B"));
    }
}
