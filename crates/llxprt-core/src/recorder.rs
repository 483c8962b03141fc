// SessionRecorder (spec §4.8): append-only JSONL journal of everything
// that happens in a session. Grounded on the teacher's durable event
// journal pattern (`everruns-core` session recording referenced from
// `protocol.rs`) but rebuilt against plain `tokio::fs` rather than a
// database table, since this crate has no storage layer of its own.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use llxprt_contracts::{JournalLine, JournalLineType};
use serde_json::Value;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::error::Result;

#[derive(Default)]
struct State {
    /// Materialized once the first `content` event arrives (or eagerly,
    /// on resume). `None` means every line so far is pre-content and is
    /// only ever held in `pending`, never opened against disk.
    path: Option<PathBuf>,
    handle: Option<File>,
    /// Lines produced before the file could be opened (e.g. directory not
    /// yet created, or no `content` event has arrived yet) — flushed in
    /// order once a path is materialized and the handle opens.
    pending: Vec<JournalLine>,
    /// Set once an I/O error (ENOSPC, EACCES, ...) makes the journal
    /// unusable. The recorder goes silently inactive rather than
    /// panicking or propagating the error on every subsequent line: a
    /// session should keep running even if its journal can't be written.
    inactive: bool,
}

pub struct SessionRecorder {
    dir: PathBuf,
    session_id: String,
    seq: AtomicU64,
    draining: AtomicBool,
    state: Mutex<State>,
}

impl SessionRecorder {
    /// `dir` is where the journal file lands once named; `session_id`
    /// supplies the file name's prefix. The file itself isn't created
    /// until the first `content` event (spec §4.8) unless
    /// `initialize_for_resume` sets the path eagerly.
    pub fn new(dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.into(),
            session_id: session_id.into(),
            seq: AtomicU64::new(1),
            draining: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        })
    }

    /// Resume a previously-started session: pin the journal to its
    /// existing file and restore sequence numbering from `last_seq`
    /// rather than deriving a fresh `session-<minute>-<prefix>.jsonl`
    /// name from a `content` event. Call once, before the first
    /// `record`.
    pub async fn initialize_for_resume(&self, file_path: impl Into<PathBuf>, last_seq: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.path = Some(file_path.into());
        self.seq.store(last_seq, Ordering::SeqCst);
        self.open_locked(&mut state).await;
        Ok(())
    }

    /// `session-<UTC minute epoch>-<first 8 chars of session id>.jsonl`.
    fn session_file_name(&self) -> String {
        let minute_epoch = Utc::now().timestamp() / 60;
        let prefix: String = self.session_id.chars().take(8).collect();
        format!("session-{minute_epoch}-{prefix}.jsonl")
    }

    async fn open_locked(&self, state: &mut State) {
        if state.handle.is_some() || state.inactive {
            return;
        }
        let Some(path) = state.path.clone() else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                if !matches!(err.kind(), ErrorKind::AlreadyExists) {
                    self.go_inactive(state, &path, &err.to_string());
                    return;
                }
            }
        }
        match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(file) => state.handle = Some(file),
            Err(err) => self.go_inactive(state, &path, &err.to_string()),
        }
    }

    fn go_inactive(&self, state: &mut State, path: &std::path::Path, reason: &str) {
        warn!(path = %path.display(), reason, "session journal going inactive");
        state.inactive = true;
        state.handle = None;
        state.pending.clear();
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Append one line. Before the first `content` event, lines queue in
    /// `pending` without touching disk; the first `content` line
    /// materializes the file name, creates the directory, and flushes
    /// the buffered lines ahead of itself. Once the file handle is open,
    /// lines still queue in `pending` and drain (in order) on the next
    /// successful write — content generated before the journal is ready
    /// is never silently lost.
    pub async fn record(&self, line_type: JournalLineType, payload: Value) {
        let line = JournalLine::new(self.next_seq(), line_type, payload);
        let mut state = self.state.lock().await;
        if state.inactive {
            return;
        }
        if state.path.is_none() && matches!(line_type, JournalLineType::Content) {
            state.path = Some(self.dir.join(self.session_file_name()));
        }
        state.pending.push(line);
        self.drain_locked(&mut state).await;
    }

    /// Drains `pending` into the file. Only one drain runs at a time per
    /// recorder (`draining` flag); a `record` call that arrives mid-drain
    /// just appends to `pending` and returns, relying on the in-flight
    /// drain (which re-checks `pending` before releasing the flag) to
    /// pick it up rather than spawning a second writer.
    async fn drain_locked(&self, state: &mut State) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }

        self.open_locked(state).await;

        loop {
            if state.inactive || state.pending.is_empty() {
                break;
            }
            let Some(handle) = state.handle.as_mut() else {
                break;
            };
            let batch = std::mem::take(&mut state.pending);
            let mut buf = String::new();
            for line in &batch {
                match line.to_jsonl() {
                    Ok(jsonl) => buf.push_str(&jsonl),
                    Err(err) => warn!(error = %err, "dropping unserializable journal line"),
                }
            }
            let path = state.path.clone().expect("handle open implies a materialized path");
            if let Err(err) = handle.write_all(buf.as_bytes()).await {
                error!(path = %path.display(), error = %err, "journal write failed");
                self.go_inactive(state, &path, &err.to_string());
                break;
            }
            if let Err(err) = handle.flush().await {
                self.go_inactive(state, &path, &err.to_string());
                break;
            }
        }

        self.draining.store(false, Ordering::SeqCst);
    }

    /// Flush any buffered lines and drop the write handle. Intended for
    /// graceful session shutdown; a recorder can still be reused
    /// afterwards (`record` will reopen the file) but won't be, normally.
    pub async fn flush_and_close(&self) {
        let mut state = self.state.lock().await;
        self.drain_locked(&mut state).await;
        if let Some(mut handle) = state.handle.take() {
            let _ = handle.flush().await;
        }
    }

    pub async fn is_active(&self) -> bool {
        !self.state.lock().await.inactive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn only_entry(dir: &std::path::Path) -> std::path::PathBuf {
        let mut entries: Vec<_> = std::fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(entries.len(), 1, "expected exactly one journal file in {dir:?}");
        entries.pop().unwrap()
    }

    #[tokio::test]
    async fn pre_content_lines_are_buffered_and_flushed_with_the_first_content_line() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), "abcdefgh-1234");

        recorder
            .record(JournalLineType::SessionStart, json!({"n": 1}))
            .await;
        assert!(recorder.is_active().await);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none(), "no content event yet, nothing should be written");

        recorder
            .record(JournalLineType::Content, json!({"n": 2}))
            .await;
        recorder.flush_and_close().await;

        let file = only_entry(dir.path());
        let name = file.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("session-"), "unexpected journal file name: {name}");
        assert!(name.contains("abcdefgh"), "unexpected journal file name: {name}");

        let contents = tokio::fs::read_to_string(&file).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"seq\":1"));
        assert!(lines[1].contains("\"seq\":2"));
    }

    #[tokio::test]
    async fn materializing_the_file_creates_missing_directories() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("nested");
        let recorder = SessionRecorder::new(&dir, "session-1");

        recorder
            .record(JournalLineType::Content, json!({"n": 1}))
            .await;
        assert!(recorder.is_active().await);
        recorder.flush_and_close().await;

        let contents = tokio::fs::read_to_string(only_entry(&dir)).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn initialize_for_resume_opens_the_handle_and_restores_seq() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.jsonl");
        let recorder = SessionRecorder::new(dir.path(), "session-1");
        recorder.initialize_for_resume(&path, 42).await.unwrap();
        assert!(path.exists());

        recorder
            .record(JournalLineType::SessionStart, json!({"n": 1}))
            .await;
        recorder.flush_and_close().await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("\"seq\":42"));
    }
}
