// LoopDetector (spec §4.7): watches one turn's stream of tool calls and
// generated content for signs the model is stuck repeating itself.
// Grounded on the sliding-window repetition counters the teacher keeps
// for rate-limit backoff bookkeeping in `durable/src/reliability`,
// adapted here to content/tool-call repetition instead of retry timing.

use std::collections::HashMap;

use llxprt_contracts::ToolCallRequest;
use serde_json::Value;

/// Identical tool call (same name + same args) seen this many times in a
/// turn trips the detector.
pub const IDENTICAL_TOOL_CALL_THRESHOLD: u32 = 50;

/// Content-chanting detector parameters.
const CHANT_WINDOW_BYTES: usize = 50;
const CHANT_CAP_BYTES: usize = 5000;
const CHANT_RECURRENCE_THRESHOLD: u32 = 50;
const CHANT_MIN_SPACING_BYTES: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    IdenticalToolCall,
    ContentChanting,
    TurnOverflow,
}

/// Structural markdown that legitimately repeats short strings (table
/// pipes, list markers, fence delimiters) and should reset the
/// chanting window rather than count toward it.
fn is_structural_reset(window: &str) -> bool {
    let trimmed = window.trim_start();
    trimmed.starts_with("```")
        || trimmed.starts_with('|')
        || trimmed.starts_with("- ")
        || trimmed.starts_with("* ")
        || trimmed.starts_with('#')
        || trimmed.starts_with('>')
        || trimmed.starts_with("---")
        || trimmed.starts_with("===")
}

#[derive(Debug, Default)]
pub struct LoopDetector {
    tool_call_counts: HashMap<(String, String), u32>,
    content_buffer: String,
    chant_counts: HashMap<String, (u32, usize)>,
    bytes_seen: usize,
    turn_count: u32,
    max_turns: u32,
}

impl LoopDetector {
    pub fn new(max_turns: u32) -> Self {
        Self {
            max_turns,
            ..Default::default()
        }
    }

    /// Record one tool call; returns a signal if the identical-call
    /// threshold is now exceeded.
    pub fn observe_tool_call(&mut self, call: &ToolCallRequest) -> Option<LoopSignal> {
        let key = (call.name.clone(), canonical_args(&call.args));
        let count = self.tool_call_counts.entry(key).or_insert(0);
        *count += 1;
        if *count > IDENTICAL_TOOL_CALL_THRESHOLD {
            Some(LoopSignal::IdenticalToolCall)
        } else {
            None
        }
    }

    /// Feed a chunk of generated text content; returns a signal if the
    /// same short window recurs too densely to be legitimate structure.
    pub fn observe_content(&mut self, chunk: &str) -> Option<LoopSignal> {
        self.content_buffer.push_str(chunk);
        if self.content_buffer.len() > CHANT_CAP_BYTES {
            let overflow = self.content_buffer.len() - CHANT_CAP_BYTES;
            self.content_buffer.drain(0..overflow);
        }

        let mut signal = None;
        while self.content_buffer.len() >= CHANT_WINDOW_BYTES {
            let window: String = self
                .content_buffer
                .chars()
                .take(CHANT_WINDOW_BYTES)
                .collect();
            self.bytes_seen += 1;

            if is_structural_reset(&window) {
                self.chant_counts.clear();
            } else {
                let entry = self.chant_counts.entry(window).or_insert((0, self.bytes_seen));
                let (count, last_seen) = *entry;
                if self.bytes_seen.saturating_sub(last_seen) <= CHANT_MIN_SPACING_BYTES {
                    entry.0 = count + 1;
                    entry.1 = self.bytes_seen;
                    if entry.0 > CHANT_RECURRENCE_THRESHOLD {
                        signal = Some(LoopSignal::ContentChanting);
                    }
                } else {
                    *entry = (1, self.bytes_seen);
                }
            }

            self.content_buffer.drain(0..1);
            if signal.is_some() {
                break;
            }
        }
        signal
    }

    /// Advance the turn counter; returns `TurnOverflow` once the turn
    /// budget for this agent session is exhausted.
    pub fn observe_turn(&mut self) -> Option<LoopSignal> {
        self.turn_count += 1;
        if self.max_turns > 0 && self.turn_count > self.max_turns {
            Some(LoopSignal::TurnOverflow)
        } else {
            None
        }
    }

    pub fn reset_tool_calls(&mut self) {
        self.tool_call_counts.clear();
    }
}

fn canonical_args(args: &Value) -> String {
    serde_json::to_string(args).unwrap_or_default()
}
