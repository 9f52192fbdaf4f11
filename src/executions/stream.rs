//! Incremental parser for the agent's `stream-json` output
//!
//! [`reduce`] folds one raw line into a [`StreamState`] and returns the logical events
//! it produced. It never touches I/O, so the same fixtures drive the tests and the
//! engine. Consecutive text (or thinking) fragments are coalesced into one block that
//! is emitted when a different kind of content arrives, when the content block ends,
//! or on [`flush`].

use serde::Serialize;
use serde_json::Value;

/// Tool the agent calls to hand back a finished plan in plan mode
pub const EXIT_PLAN_TOOL: &str = "ExitPlanMode";

/// Presentation-level view of the stream
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamBlock {
    Text { content: String },
    Thinking { content: String },
    ToolUse { name: String },
    Raw { content: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Block(StreamBlock),
    Session(String),
    Phase(String),
    PlanReady(String),
    Result { text: String, is_error: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PendingKind {
    Text,
    Thinking,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamState {
    pending: Option<(PendingKind, String)>,
    /// Deltas were streamed for the current assistant message
    streamed: bool,
    pub session_id: Option<String>,
    pub phase: Option<String>,
    pub plan: Option<String>,
    pub result: Option<String>,
    /// All text the agent produced, in order
    pub text: String,
}

impl StreamState {
    /// Final human-readable output: the result message, or all text seen
    pub fn clean_output(&self) -> String {
        match &self.result {
            Some(result) if !result.trim().is_empty() => result.clone(),
            _ => self.text.trim().to_string(),
        }
    }
}

/// Fold one raw output line into the state
pub fn reduce(mut state: StreamState, line: &str) -> (StreamState, Vec<StreamEvent>) {
    let mut events = Vec::new();

    let Ok(value) = serde_json::from_str::<Value>(line) else {
        if !line.trim().is_empty() {
            flush_into(&mut state, &mut events);
            events.push(StreamEvent::Block(StreamBlock::Raw {
                content: line.to_string(),
            }));
        }
        return (state, events);
    };

    if state.session_id.is_none() {
        if let Some(session) = value.get("session_id").and_then(Value::as_str) {
            state.session_id = Some(session.to_string());
            events.push(StreamEvent::Session(session.to_string()));
        }
    }

    match value.get("type").and_then(Value::as_str) {
        Some("stream_event") => {
            if let Some(event) = value.get("event") {
                reduce_stream_event(&mut state, event, &mut events);
            }
        }
        Some("assistant") => {
            let blocks = value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            reduce_assistant(&mut state, &blocks, &mut events);
        }
        Some("result") => {
            flush_into(&mut state, &mut events);
            let text = value
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let is_error = value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            state.result = Some(text.clone());
            events.push(StreamEvent::Result { text, is_error });
        }
        _ => {}
    }

    (state, events)
}

/// Emit any coalesced fragment still pending
pub fn flush(mut state: StreamState) -> (StreamState, Vec<StreamEvent>) {
    let mut events = Vec::new();
    flush_into(&mut state, &mut events);
    (state, events)
}

fn reduce_stream_event(state: &mut StreamState, event: &Value, events: &mut Vec<StreamEvent>) {
    match event.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => {
            let delta = event.get("delta");
            match delta.and_then(|d| d.get("type")).and_then(Value::as_str) {
                Some("text_delta") => {
                    let text = delta
                        .and_then(|d| d.get("text"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    state.streamed = true;
                    append(state, PendingKind::Text, text, events);
                    set_phase(state, "responding", events);
                }
                Some("thinking_delta") => {
                    let text = delta
                        .and_then(|d| d.get("thinking"))
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    state.streamed = true;
                    append(state, PendingKind::Thinking, text, events);
                    set_phase(state, "thinking", events);
                }
                _ => {}
            }
        }
        Some("content_block_start") => {
            let block = event.get("content_block");
            if block.and_then(|b| b.get("type")).and_then(Value::as_str) == Some("tool_use") {
                let name = block
                    .and_then(|b| b.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("tool")
                    .to_string();
                state.streamed = true;
                flush_into(state, events);
                set_phase(state, &format!("using {}", name), events);
                events.push(StreamEvent::Block(StreamBlock::ToolUse { name }));
            }
        }
        Some("content_block_stop") | Some("message_stop") => flush_into(state, events),
        _ => {}
    }
}

fn reduce_assistant(state: &mut StreamState, blocks: &[Value], events: &mut Vec<StreamEvent>) {
    let streamed = std::mem::take(&mut state.streamed);
    flush_into(state, events);

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") if !streamed => {
                let text = block.get("text").and_then(Value::as_str).unwrap_or_default();
                if !text.is_empty() {
                    append(state, PendingKind::Text, text, events);
                    set_phase(state, "responding", events);
                }
            }
            Some("thinking") if !streamed => {
                let text = block
                    .get("thinking")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !text.is_empty() {
                    append(state, PendingKind::Thinking, text, events);
                    set_phase(state, "thinking", events);
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("tool")
                    .to_string();
                if !streamed {
                    flush_into(state, events);
                    set_phase(state, &format!("using {}", name), events);
                    events.push(StreamEvent::Block(StreamBlock::ToolUse { name: name.clone() }));
                }
                if name == EXIT_PLAN_TOOL {
                    let plan = block
                        .pointer("/input/plan")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    flush_into(state, events);
                    state.plan = Some(plan.clone());
                    set_phase(state, "plan ready", events);
                    events.push(StreamEvent::PlanReady(plan));
                }
            }
            _ => {}
        }
    }
    flush_into(state, events);
}

fn append(state: &mut StreamState, kind: PendingKind, text: &str, events: &mut Vec<StreamEvent>) {
    if text.is_empty() {
        return;
    }
    if kind == PendingKind::Text {
        state.text.push_str(text);
    }
    if let Some((pending_kind, buffer)) = state.pending.as_mut() {
        if *pending_kind == kind {
            buffer.push_str(text);
            return;
        }
    }
    flush_into(state, events);
    state.pending = Some((kind, text.to_string()));
}

fn flush_into(state: &mut StreamState, events: &mut Vec<StreamEvent>) {
    let Some((kind, content)) = state.pending.take() else {
        return;
    };
    if kind == PendingKind::Text && !state.text.ends_with('\n') {
        state.text.push('\n');
    }
    let block = match kind {
        PendingKind::Text => StreamBlock::Text { content },
        PendingKind::Thinking => StreamBlock::Thinking { content },
    };
    events.push(StreamEvent::Block(block));
}

fn set_phase(state: &mut StreamState, phase: &str, events: &mut Vec<StreamEvent>) {
    if state.phase.as_deref() != Some(phase) {
        state.phase = Some(phase.to_string());
        events.push(StreamEvent::Phase(phase.to_string()));
    }
}

/// Only the blocks out of a batch of events
pub fn blocks(events: &[StreamEvent]) -> Vec<StreamBlock> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Block(block) => Some(block.clone()),
            _ => None,
        })
        .collect()
}
