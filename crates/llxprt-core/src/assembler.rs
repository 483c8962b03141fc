// ToolCallAssembler (spec §4.4): accumulates streamed `tool_call_fragment`
// events, keyed by the index the provider assigns, into complete
// `ToolCallRequest`s once the stream finishes. Grounded on the fragment
// accumulation the teacher's `openai.rs` does inline in its SSE loop,
// pulled out here so every driver shares one implementation.

use std::collections::{BTreeMap, HashSet};

use llxprt_contracts::{lenient_decode_args, ToolCallFragment, ToolCallRequest};
use uuid::Uuid;

#[derive(Debug, Default)]
struct PendingCall {
    id: Option<String>,
    name: Option<String>,
    args: String,
    last_fragment: Option<(Option<String>, Option<String>)>,
}

/// One assembler per turn. Not `Send`-shared; driven from the single task
/// consuming the provider's event stream.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    pending: BTreeMap<usize, PendingCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one fragment in. `name` is last-write-wins (a provider may
    /// repeat it across fragments); `args_delta` is concatenated in
    /// arrival order; a fragment's `id`, once seen, is never overwritten
    /// by a later fragment's absence of one. A fragment carrying the same
    /// `(name, args_delta)` pair as the previous one for this index is a
    /// retransmission and is suppressed rather than appended again.
    pub fn ingest(&mut self, fragment: ToolCallFragment) {
        let entry = self.pending.entry(fragment.index).or_default();
        let incoming = (fragment.name.clone(), fragment.args_delta.clone());
        if (incoming.0.is_some() || incoming.1.is_some()) && entry.last_fragment == Some(incoming.clone()) {
            return;
        }
        if let Some(id) = fragment.id {
            entry.id = Some(id);
        }
        if let Some(name) = fragment.name {
            entry.name = Some(name);
        }
        if let Some(delta) = fragment.args_delta {
            entry.args.push_str(&delta);
        }
        entry.last_fragment = Some(incoming);
    }

    /// Materialize every pending call, in ascending index order, skipping
    /// one with no name (a provider that never closed the descriptor). A
    /// call whose concatenated args fail strict JSON parsing degrades to
    /// `lenient_decode_args` rather than being dropped. If the same
    /// `callId` surfaces under two different indices, the second
    /// occurrence is dropped before emission.
    pub fn finish(self, agent_id: &str, prompt_id: &str) -> Vec<ToolCallRequest> {
        let mut seen_ids = HashSet::new();
        self.pending
            .into_values()
            .filter_map(|call| {
                let name = call.name?;
                let call_id = call.id.unwrap_or_else(|| format!("call_{}", Uuid::now_v7()));
                if !seen_ids.insert(call_id.clone()) {
                    return None;
                }
                let args = lenient_decode_args(&call.args);
                Some(ToolCallRequest {
                    call_id,
                    name,
                    args,
                    is_client_initiated: false,
                    prompt_id: prompt_id.to_string(),
                    agent_id: agent_id.to_string(),
                })
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frag(index: usize, id: Option<&str>, name: Option<&str>, delta: Option<&str>) -> ToolCallFragment {
        ToolCallFragment {
            index,
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            args_delta: delta.map(str::to_string),
        }
    }

    #[test]
    fn concatenates_args_across_fragments_in_order() {
        let mut asm = ToolCallAssembler::new();
        asm.ingest(frag(0, Some("call_1"), Some("ReadFile"), Some("{\"path\":")));
        asm.ingest(frag(0, None, None, Some("\"/tmp/x\"}")));
        let calls = asm.finish("agent-1", "prompt-1");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args, json!({"path": "/tmp/x"}));
    }

    #[test]
    fn name_is_last_write_wins() {
        let mut asm = ToolCallAssembler::new();
        asm.ingest(frag(0, Some("call_1"), Some("Read"), None));
        asm.ingest(frag(0, None, Some("ReadFile"), None));
        let calls = asm.finish("agent-1", "prompt-1");
        assert_eq!(calls[0].name, "ReadFile");
    }

    #[test]
    fn distinct_indices_produce_distinct_calls_in_order() {
        let mut asm = ToolCallAssembler::new();
        asm.ingest(frag(1, Some("call_b"), Some("Second"), Some("{}")));
        asm.ingest(frag(0, Some("call_a"), Some("First"), Some("{}")));
        let calls = asm.finish("agent-1", "prompt-1");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "First");
        assert_eq!(calls[1].name, "Second");
    }

    #[test]
    fn malformed_args_fall_back_to_lenient_decode() {
        let mut asm = ToolCallAssembler::new();
        asm.ingest(frag(0, Some("call_1"), Some("Shell"), Some("not json at all")));
        let calls = asm.finish("agent-1", "prompt-1");
        assert_eq!(calls[0].args, json!({"value": "not json at all"}));
    }

    #[test]
    fn call_without_a_name_is_dropped() {
        let mut asm = ToolCallAssembler::new();
        asm.ingest(frag(0, Some("call_1"), None, Some("{}")));
        let calls = asm.finish("agent-1", "prompt-1");
        assert!(calls.is_empty());
    }

    #[test]
    fn repeated_fragment_is_suppressed() {
        let mut asm = ToolCallAssembler::new();
        asm.ingest(frag(0, Some("call_1"), Some("ReadFile"), Some("{\"path\":\"/x\"}")));
        asm.ingest(frag(0, Some("call_1"), Some("ReadFile"), Some("{\"path\":\"/x\"}")));
        let calls = asm.finish("agent-1", "prompt-1");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args, json!({"path": "/x"}));
    }

    #[test]
    fn same_call_id_across_indices_is_deduplicated() {
        let mut asm = ToolCallAssembler::new();
        asm.ingest(frag(0, Some("call_1"), Some("ReadFile"), Some("{}")));
        asm.ingest(frag(1, Some("call_1"), Some("ReadFile"), Some("{}")));
        let calls = asm.finish("agent-1", "prompt-1");
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn missing_id_is_synthesized() {
        let mut asm = ToolCallAssembler::new();
        asm.ingest(frag(0, None, Some("Ls"), Some("{}")));
        let calls = asm.finish("agent-1", "prompt-1");
        assert!(calls[0].call_id.starts_with("call_"));
    }
}
