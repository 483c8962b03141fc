// One line of the append-only session journal (see spec §6).
//
// `<chatsDir>/session-<YYYY-MM-DDTHH-MM>-<sid8>.jsonl`, one JSON object per
// line, trailing `\n`. Readers may tail concurrently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalLineType {
    SessionStart,
    Content,
    Compressed,
    Rewind,
    ProviderSwitch,
    SessionEvent,
    DirectoriesChanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLine {
    pub v: u32,
    /// Monotonic, strictly increasing per session file, starting at 1.
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub line_type: JournalLineType,
    pub payload: Value,
}

impl JournalLine {
    pub fn new(seq: u64, line_type: JournalLineType, payload: Value) -> Self {
        Self {
            v: 1,
            seq,
            ts: Utc::now(),
            line_type,
            payload,
        }
    }

    /// Serialize as one JSONL line, trailing newline included.
    pub fn to_jsonl(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_trailing_newline() {
        let line = JournalLine::new(1, JournalLineType::SessionStart, serde_json::json!({}));
        let jsonl = line.to_jsonl().unwrap();
        assert!(jsonl.ends_with('\n'));
        assert!(jsonl.contains("\"seq\":1"));
        assert!(jsonl.contains("\"type\":\"session_start\""));
    }
}
