//! Session history: append-only logs of commands, telemetry and frames.
//!
//! Each kind sits behind its own lock so the command channel and the two
//! listeners never contend with each other. Records are stored as `Arc`s;
//! readers get cheap clones and a record never changes once appended.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::codec::Response;
use crate::telemetry::{TelemetryBaseline, TelemetrySnapshot};
use crate::video::Image;
use crate::yaml_utils::{self, duration_ms_f64};
use crate::Result;

/// The three history kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Commands,
    Telemetry,
    Frames,
}

impl fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HistoryKind::Commands => "commands",
            HistoryKind::Telemetry => "telemetry",
            HistoryKind::Frames => "frames",
        })
    }
}

/// One command exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// When the command was handed to the socket
    pub issued_at: DateTime<Utc>,

    /// Wire text of the command
    pub command: String,

    /// Reply, or the timeout marker
    pub response: Response,

    #[serde(rename = "send_ms", with = "duration_ms_f64")]
    pub send_duration: Duration,

    /// Time spent waiting for the reply, including a full timeout
    #[serde(rename = "receive_ms", with = "duration_ms_f64")]
    pub receive_duration: Duration,
}

/// One frame from the video stream.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Position in the frame history
    pub index: u64,
    pub received_at: DateTime<Utc>,
    pub image: Arc<Image>,
}

/// What gets persisted for a frame; the pixels stay in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSummary {
    pub index: u64,
    pub received_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
}

impl From<&VideoFrame> for FrameSummary {
    fn from(frame: &VideoFrame) -> Self {
        Self {
            index: frame.index,
            received_at: frame.received_at,
            width: frame.image.width,
            height: frame.image.height,
            bytes: frame.image.data.len(),
        }
    }
}

/// An append-only, individually locked sequence.
#[derive(Debug)]
pub struct Log<T> {
    entries: Mutex<Vec<Arc<T>>>,
}

impl<T> Default for Log<T> {
    fn default() -> Self {
        Self { entries: Mutex::new(Vec::new()) }
    }
}

impl<T> Log<T> {
    /// Append a record and return its index.
    pub fn append(&self, record: T) -> usize {
        self.append_shared(Arc::new(record))
    }

    /// Append an already shared record and return its index.
    pub fn append_shared(&self, record: Arc<T>) -> usize {
        let mut entries = self.entries.lock();
        entries.push(record);
        entries.len() - 1
    }

    /// Most recent record.
    pub fn latest(&self) -> Option<Arc<T>> {
        self.entries.lock().last().cloned()
    }

    pub fn get(&self, index: usize) -> Option<Arc<T>> {
        self.entries.lock().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Point-in-time copy of the sequence.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.lock().clone()
    }
}

/// Command, telemetry and frame history of one session.
#[derive(Debug, Default)]
pub struct HistoryStore {
    commands: Log<CommandRecord>,
    telemetry: Log<TelemetrySnapshot>,
    frames: Log<VideoFrame>,
    baseline: OnceLock<TelemetryBaseline>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &Log<CommandRecord> {
        &self.commands
    }

    pub fn telemetry(&self) -> &Log<TelemetrySnapshot> {
        &self.telemetry
    }

    pub fn frames(&self) -> &Log<VideoFrame> {
        &self.frames
    }

    pub fn len(&self, kind: HistoryKind) -> usize {
        match kind {
            HistoryKind::Commands => self.commands.len(),
            HistoryKind::Telemetry => self.telemetry.len(),
            HistoryKind::Frames => self.frames.len(),
        }
    }

    /// Telemetry baseline, once computed.
    pub fn baseline(&self) -> Option<&TelemetryBaseline> {
        self.baseline.get()
    }

    /// Freeze the baseline. Returns `false` if one was already set.
    pub fn set_baseline(&self, baseline: TelemetryBaseline) -> bool {
        self.baseline.set(baseline).is_ok()
    }

    /// Serialize the full sequence of one kind.
    ///
    /// The lock is held only while the `Arc` list is copied; serialization
    /// runs unlocked, so appends to every kind continue meanwhile.
    pub fn flush(&self, kind: HistoryKind) -> Result<Vec<u8>> {
        match kind {
            HistoryKind::Commands => {
                let records = self.commands.snapshot();
                let records: Vec<&CommandRecord> = records.iter().map(Arc::as_ref).collect();
                yaml_utils::to_yaml_bytes(&records)
            }
            HistoryKind::Telemetry => {
                let records = self.telemetry.snapshot();
                let records: Vec<&TelemetrySnapshot> = records.iter().map(Arc::as_ref).collect();
                yaml_utils::to_yaml_bytes(&records)
            }
            HistoryKind::Frames => {
                let records = self.frames.snapshot();
                let summaries: Vec<FrameSummary> =
                    records.iter().map(|f| FrameSummary::from(f.as_ref())).collect();
                yaml_utils::to_yaml_bytes(&summaries)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(command: &str, response: Response) -> CommandRecord {
        CommandRecord {
            issued_at: Utc::now(),
            command: command.to_string(),
            response,
            send_duration: Duration::from_micros(120),
            receive_duration: Duration::from_millis(8),
        }
    }

    #[test]
    fn latest_is_idempotent_without_appends() {
        let store = HistoryStore::new();
        assert!(store.commands().latest().is_none());
        store.commands().append(record("command", Response::Ok));
        store.commands().append(record("battery?", Response::Value("87".into())));

        let first = store.commands().latest().unwrap();
        let second = store.commands().latest().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.command, "battery?");
    }

    #[test]
    fn get_by_index_and_out_of_range() {
        let log: Log<u32> = Log::default();
        assert_eq!(log.append(7), 0);
        assert_eq!(log.append(9), 1);
        assert_eq!(*log.get(0).unwrap(), 7);
        assert!(log.get(2).is_none());
        assert_eq!(log.len(), 2);
        assert!(!log.is_empty());
    }

    #[test]
    fn baseline_is_frozen_after_first_set() {
        let store = HistoryStore::new();
        let mut acc = crate::telemetry::BaselineAccumulator::new(1);
        let mut fields = BTreeMap::new();
        fields.insert("h".to_string(), 10.0);
        let baseline = acc.push(&fields).unwrap();
        assert!(store.set_baseline(baseline.clone()));
        assert!(!store.set_baseline(baseline));
        assert_eq!(store.baseline().unwrap().get("h"), Some(10.0));
    }

    #[test]
    fn flush_commands_marks_timeouts() {
        let store = HistoryStore::new();
        store.commands().append(record("takeoff", Response::Timeout));
        let text = String::from_utf8(store.flush(HistoryKind::Commands).unwrap()).unwrap();
        assert!(text.contains("takeoff"));
        assert!(text.contains("timeout"));
        assert!(text.contains("receive_ms"));
    }

    #[test]
    fn archived_record_with_huge_duration_is_an_error() {
        let store = HistoryStore::new();
        store.commands().append(record("land", Response::Ok));
        let text = String::from_utf8(store.flush(HistoryKind::Commands).unwrap()).unwrap();
        let mut records: Vec<CommandRecord> = serde_yaml_ng::from_str(&text).unwrap();
        assert_eq!(records.pop().map(|r| r.command), Some("land".to_string()));

        let corrupted: String = text
            .lines()
            .map(|line| match line.split_once("receive_ms:") {
                Some((indent, _)) => format!("{indent}receive_ms: 1e30\n"),
                None => format!("{line}\n"),
            })
            .collect();
        assert!(corrupted.contains("receive_ms: 1e30"));
        assert!(serde_yaml_ng::from_str::<Vec<CommandRecord>>(&corrupted).is_err());
    }

    #[test]
    fn flush_frames_writes_summaries_only() {
        let store = HistoryStore::new();
        store.frames().append(VideoFrame {
            index: 0,
            received_at: Utc::now(),
            image: Arc::new(Image::new(960, 720, vec![0u8; 4096])),
        });
        let text = String::from_utf8(store.flush(HistoryKind::Frames).unwrap()).unwrap();
        assert!(text.contains("bytes: 4096"));
        assert!(text.contains("width: 960"));
        assert_eq!(store.len(HistoryKind::Frames), 1);
    }

    #[test]
    fn flush_does_not_block_concurrent_appends() {
        let store = Arc::new(HistoryStore::new());
        for i in 0..500 {
            let mut fields = BTreeMap::new();
            fields.insert("h".to_string(), i as f64);
            store.telemetry().append(TelemetrySnapshot::new(i, Utc::now(), fields));
        }

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    store.commands().append(record("stop", Response::Ok));
                }
            })
        };
        let flushed = store.flush(HistoryKind::Telemetry).unwrap();
        writer.join().unwrap();

        assert!(!flushed.is_empty());
        assert_eq!(store.len(HistoryKind::Commands), 200);
        assert_eq!(store.len(HistoryKind::Telemetry), 500);
    }
}
