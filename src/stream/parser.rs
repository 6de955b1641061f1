//! Byte stream → [`AgentEvent`]s.
//!
//! Output of the agent arrives in arbitrary chunks on two channels. Each
//! channel is split into complete lines; stdout lines are decoded as
//! `stream-json` records when possible, everything else is plain text. All
//! text goes through a [`MarkerScanner`] so embedded signals become typed
//! events. The parser never fails: anything it cannot make sense of is text.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::{
    ContentBlock, Delta, PartialEvent, WireRecord, describe_tool_use, flatten_tool_content,
    is_subagent_tool, subagent_description,
};
use crate::events::{
    AgentEvent, PermissionPayload, SessionPayload, SubagentEndPayload, SubagentStartPayload,
    ThinkingPayload, ToolCallPayload, ToolResultPayload,
};
use crate::signals::{MarkerGrammar, MarkerScanner, Segment, SignalKind};
use crate::store::UsageRecord;

const PARAGRAPH_BREAK: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

/// How response text reaches the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMode {
    /// Forward text as it arrives.
    Live,
    /// Hold all text until the caller releases it (post-moderation).
    Held,
}

/// Text held back in [`TextMode::Held`], split by what it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeldOutput {
    /// The agent's answer: assistant text, else plain stdout.
    pub response: String,
    /// Everything else: stderr, plus stray stdout lines beside an answer.
    pub diagnostics: String,
}

/// Splits bytes into lines. Only complete lines are decoded.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
    /// Bytes before this offset hold no newline.
    scanned: usize,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buf[from..].iter().position(|&b| b == b'\n') {
            let end = from + offset;
            lines.push(decode_line(&self.buf[start..end]));
            start = end + 1;
            from = start;
        }
        self.buf.drain(..start);
        self.scanned = self.buf.len();
        lines
    }

    fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[derive(Debug)]
pub struct StreamParser {
    mode: TextMode,
    stdout_lines: LineBuffer,
    stderr_lines: LineBuffer,
    /// Assistant text (JSON records) and raw text lines are separate sources,
    /// so each has its own scanner state.
    assistant_scanner: MarkerScanner,
    stdout_scanner: MarkerScanner,
    stderr_scanner: MarkerScanner,
    grammar: Arc<MarkerGrammar>,

    session: Option<SessionPayload>,
    usage: UsageRecord,
    counted_messages: HashSet<String>,
    pending_subagents: HashSet<String>,

    /// Text deltas were streamed for the current message.
    streamed_text: bool,
    /// Next assistant text starts a new block.
    at_boundary: bool,
    transcript: String,
    raw_text: String,
    final_result: Option<String>,
    result_error: Option<String>,
    stderr_tail: String,
    held_assistant: String,
    held_stdout: String,
    held_stderr: String,
}

const STDERR_TAIL_LIMIT: usize = 2048;

impl StreamParser {
    pub fn new(grammar: Arc<MarkerGrammar>, mode: TextMode) -> Self {
        Self {
            mode,
            stdout_lines: LineBuffer::default(),
            stderr_lines: LineBuffer::default(),
            assistant_scanner: MarkerScanner::new(Arc::clone(&grammar)),
            stdout_scanner: MarkerScanner::new(Arc::clone(&grammar)),
            stderr_scanner: MarkerScanner::new(Arc::clone(&grammar)),
            grammar,
            session: None,
            usage: UsageRecord::default(),
            counted_messages: HashSet::new(),
            pending_subagents: HashSet::new(),
            streamed_text: false,
            at_boundary: true,
            transcript: String::new(),
            raw_text: String::new(),
            final_result: None,
            result_error: None,
            stderr_tail: String::new(),
            held_assistant: String::new(),
            held_stdout: String::new(),
            held_stderr: String::new(),
        }
    }

    /// Feed a chunk of bytes read from `channel`.
    pub fn feed(&mut self, channel: Channel, bytes: &[u8]) -> Vec<AgentEvent> {
        let lines = match channel {
            Channel::Stdout => self.stdout_lines.push(bytes),
            Channel::Stderr => self.stderr_lines.push(bytes),
        };
        let mut events = Vec::new();
        for line in lines {
            events.extend(self.handle_line(channel, &line, true));
        }
        events
    }

    /// End of stream: decode trailing partial lines and flush the scanners.
    pub fn finish(&mut self) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        if let Some(line) = self.stdout_lines.finish() {
            events.extend(self.handle_line(Channel::Stdout, &line, false));
        }
        if let Some(line) = self.stderr_lines.finish() {
            events.extend(self.handle_line(Channel::Stderr, &line, false));
        }
        for scanner in [
            &mut self.assistant_scanner,
            &mut self.stdout_scanner,
            &mut self.stderr_scanner,
        ] {
            events.extend(scanner.finish().into_iter().map(segment_event));
        }
        events
    }

    pub fn session(&self) -> Option<&SessionPayload> {
        self.session.as_ref()
    }

    pub fn usage(&self) -> &UsageRecord {
        &self.usage
    }

    /// The agent's answer, for the transcript: assistant text, else the final
    /// `result` text, else plain stdout.
    pub fn response_text(&self) -> String {
        if !self.transcript.trim().is_empty() {
            return self.transcript.clone();
        }
        if let Some(result) = self.final_result.as_ref().filter(|r| !r.trim().is_empty()) {
            return result.clone();
        }
        self.raw_text.trim_end().to_string()
    }

    /// Error text reported by a `result` record with `is_error`.
    pub fn result_error(&self) -> Option<&str> {
        self.result_error.as_deref()
    }

    /// Last part of stderr, for error reports.
    pub fn stderr_tail(&self) -> &str {
        self.stderr_tail.trim()
    }

    /// Take the text held back in [`TextMode::Held`].
    pub fn take_held(&mut self) -> HeldOutput {
        let assistant = std::mem::take(&mut self.held_assistant);
        let stdout = std::mem::take(&mut self.held_stdout);
        let stderr = std::mem::take(&mut self.held_stderr);
        if assistant.trim().is_empty() {
            HeldOutput {
                response: format!("{}{}", assistant, stdout),
                diagnostics: stderr,
            }
        } else {
            HeldOutput {
                response: assistant,
                diagnostics: format!("{}{}", stdout, stderr),
            }
        }
    }

    /// Turn released text (moderated or original) into events.
    pub fn release(&self, text: &str) -> Vec<AgentEvent> {
        let mut scanner = MarkerScanner::new(Arc::clone(&self.grammar));
        let mut segments = scanner.push(text);
        segments.extend(scanner.finish());
        segments.into_iter().map(segment_event).collect()
    }

    fn handle_line(&mut self, channel: Channel, line: &str, terminated: bool) -> Vec<AgentEvent> {
        let newline = if terminated { "\n" } else { "" };
        match channel {
            Channel::Stderr => {
                self.push_stderr_tail(line);
                self.raw(Channel::Stderr, format!("{}{}", line, newline))
            }
            Channel::Stdout => match decode_record(line) {
                Some(record) => self.handle_record(record),
                None if line.trim_start().starts_with('{') && is_typed_json(line) => {
                    tracing::debug!(line = %truncate_for_log(line), "undecodable stream record, forwarding as text");
                    self.raw(Channel::Stdout, format!("{}{}", line, newline))
                }
                None => self.raw(Channel::Stdout, format!("{}{}", line, newline)),
            },
        }
    }

    fn handle_record(&mut self, record: WireRecord) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        match record {
            WireRecord::System {
                subtype,
                session_id,
                model,
            } => {
                if let Some(session_id) = session_id.filter(|s| !s.is_empty())
                    && self.session.is_none()
                {
                    tracing::debug!(%subtype, %session_id, "agent session reported");
                    let payload = SessionPayload { session_id, model };
                    self.session = Some(payload.clone());
                    events.push(AgentEvent::Session(payload));
                }
            }

            WireRecord::Assistant { message } => {
                let model = message
                    .model
                    .clone()
                    .or_else(|| self.session.as_ref().and_then(|s| s.model.clone()));
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            if !self.streamed_text {
                                events.extend(self.assistant_text(&text));
                            }
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            events.extend(self.tool_use(id, name, input));
                        }
                        ContentBlock::Thinking { thinking } => {
                            if !self.streamed_text && !thinking.trim().is_empty() {
                                events.push(AgentEvent::Thinking(ThinkingPayload { text: thinking }));
                            }
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => events.extend(self.tool_result(tool_use_id, &content, is_error)),
                        ContentBlock::Other => {}
                    }
                }
                self.at_boundary = true;

                // The CLI repeats a message's usage on every record of that
                // message; count each message once.
                if let Some(usage) = message.usage {
                    let first_sighting = match &message.id {
                        Some(id) => self.counted_messages.insert(id.clone()),
                        None => true,
                    };
                    if first_sighting {
                        self.usage.add(&usage.to_record(model));
                        events.push(AgentEvent::Usage(self.usage.clone()));
                    }
                }
            }

            WireRecord::User { message } => {
                for block in message.map(|m| m.blocks()).unwrap_or_default() {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        events.extend(self.tool_result(tool_use_id, &content, is_error));
                    }
                }
                self.at_boundary = true;
            }

            WireRecord::StreamEvent { event } => match event {
                PartialEvent::MessageStart {} => {
                    self.streamed_text = false;
                    self.at_boundary = true;
                }
                PartialEvent::ContentBlockDelta { delta } => match delta {
                    Delta::TextDelta { text } => {
                        self.streamed_text = true;
                        events.extend(self.assistant_text(&text));
                    }
                    Delta::ThinkingDelta { thinking } => {
                        self.streamed_text = true;
                        if !thinking.is_empty() {
                            events.push(AgentEvent::Thinking(ThinkingPayload { text: thinking }));
                        }
                    }
                    Delta::Other => {}
                },
                PartialEvent::Other => {}
            },

            WireRecord::Result {
                subtype,
                result,
                is_error,
                usage,
                total_cost_usd,
            } => {
                if is_error {
                    self.result_error = Some(
                        result
                            .clone()
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| subtype.clone()),
                    );
                } else if self.transcript.trim().is_empty()
                    && let Some(text) = result.as_ref().filter(|r| !r.trim().is_empty())
                {
                    events.extend(self.assistant_text(text));
                }
                self.final_result = result;

                let mut totals = usage
                    .map(|u| u.to_record(None))
                    .unwrap_or_default();
                totals.cost_usd = total_cost_usd;
                if !totals.is_empty() {
                    self.usage.reconcile(&totals);
                    events.push(AgentEvent::Usage(self.usage.clone()));
                }
            }

            WireRecord::Unknown => {}
        }
        events
    }

    fn tool_use(&mut self, id: Option<String>, name: String, input: Value) -> Vec<AgentEvent> {
        let mut events = vec![AgentEvent::ToolCall(ToolCallPayload {
            id: id.clone(),
            summary: describe_tool_use(&name, &input),
            name: name.clone(),
            input: input.clone(),
        })];
        if is_subagent_tool(&name) {
            if let Some(id) = &id {
                self.pending_subagents.insert(id.clone());
            }
            events.push(AgentEvent::SubagentStart(SubagentStartPayload {
                id,
                description: subagent_description(&input),
            }));
        }
        events
    }

    fn tool_result(
        &mut self,
        id: Option<String>,
        content: &Value,
        is_error: bool,
    ) -> Vec<AgentEvent> {
        let content = flatten_tool_content(content);
        let mut events = vec![AgentEvent::ToolResult(ToolResultPayload {
            id: id.clone(),
            content: content.clone(),
            is_error,
        })];
        if let Some(task_id) = &id
            && self.pending_subagents.remove(task_id)
        {
            events.push(AgentEvent::SubagentEnd(SubagentEndPayload {
                id,
                result: Some(content).filter(|c| !c.is_empty()),
            }));
        }
        events
    }

    /// Response text from assistant records or deltas.
    fn assistant_text(&mut self, text: &str) -> Vec<AgentEvent> {
        if text.is_empty() {
            return Vec::new();
        }
        let separate = self.at_boundary
            && !self.transcript.is_empty()
            && !self.transcript.ends_with('\n');
        self.at_boundary = false;

        let chunk = if separate {
            format!("{}{}", PARAGRAPH_BREAK, text)
        } else {
            text.to_string()
        };
        self.transcript.push_str(&chunk);
        match self.mode {
            TextMode::Held => {
                self.held_assistant.push_str(&chunk);
                Vec::new()
            }
            TextMode::Live => self
                .assistant_scanner
                .push(&chunk)
                .into_iter()
                .map(segment_event)
                .collect(),
        }
    }

    /// Plain text lines from either channel.
    fn raw(&mut self, channel: Channel, text: String) -> Vec<AgentEvent> {
        if text.is_empty() {
            return Vec::new();
        }
        if channel == Channel::Stdout {
            self.raw_text.push_str(&text);
        }
        match self.mode {
            TextMode::Held => {
                match channel {
                    Channel::Stdout => self.held_stdout.push_str(&text),
                    Channel::Stderr => self.held_stderr.push_str(&text),
                }
                Vec::new()
            }
            TextMode::Live => {
                let scanner = match channel {
                    Channel::Stdout => &mut self.stdout_scanner,
                    Channel::Stderr => &mut self.stderr_scanner,
                };
                scanner.push(&text).into_iter().map(segment_event).collect()
            }
        }
    }

    fn push_stderr_tail(&mut self, line: &str) {
        self.stderr_tail.push_str(line);
        self.stderr_tail.push('\n');
        if self.stderr_tail.len() > STDERR_TAIL_LIMIT {
            let mut cut = self.stderr_tail.len() - STDERR_TAIL_LIMIT;
            while !self.stderr_tail.is_char_boundary(cut) {
                cut += 1;
            }
            self.stderr_tail.drain(..cut);
        }
    }
}

/// A line is a record only if it is a JSON object with a string `type`.
fn decode_record(line: &str) -> Option<WireRecord> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn is_typed_json(line: &str) -> bool {
    serde_json::from_str::<Value>(line.trim())
        .ok()
        .and_then(|v| v.get("type").map(Value::is_string))
        .unwrap_or(false)
}

fn truncate_for_log(line: &str) -> String {
    line.chars().take(200).collect()
}

fn segment_event(segment: Segment) -> AgentEvent {
    match segment {
        Segment::Text(text) => AgentEvent::stdout(text),
        Segment::Signal { kind, body } => signal_event(kind, &body),
    }
}

/// Build the event for a marker body. JSON object bodies fill payload
/// fields; anything else becomes the payload's main text.
pub fn signal_event(kind: SignalKind, body: &str) -> AgentEvent {
    let text = body.trim();
    let fields: Map<String, Value> = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let field = |name: &str| fields.get(name).and_then(Value::as_str).map(str::to_string);

    match kind {
        SignalKind::ToolCall => {
            let name = field("name")
                .or_else(|| field("tool"))
                .unwrap_or_else(|| text.to_string());
            let input = fields.get("input").cloned().unwrap_or(Value::Null);
            AgentEvent::ToolCall(ToolCallPayload {
                id: field("id"),
                summary: describe_tool_use(&name, &input),
                name,
                input,
            })
        }
        SignalKind::ToolResult => AgentEvent::ToolResult(ToolResultPayload {
            id: field("id").or_else(|| field("tool_use_id")),
            content: match fields.get("content") {
                Some(content) => flatten_tool_content(content),
                None if fields.is_empty() => text.to_string(),
                None => String::new(),
            },
            is_error: fields
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        SignalKind::PermissionRequest => AgentEvent::PermissionRequest(PermissionPayload {
            tool: field("tool"),
            message: field("message").unwrap_or_else(|| text.to_string()),
        }),
        SignalKind::SubagentStart => AgentEvent::SubagentStart(SubagentStartPayload {
            id: field("id"),
            description: field("description").unwrap_or_else(|| text.to_string()),
        }),
        SignalKind::SubagentEnd => AgentEvent::SubagentEnd(SubagentEndPayload {
            id: field("id"),
            result: field("result")
                .or_else(|| fields.is_empty().then(|| text.to_string()))
                .filter(|r| !r.is_empty()),
        }),
        SignalKind::Thinking => AgentEvent::Thinking(ThinkingPayload {
            text: field("text").unwrap_or_else(|| text.to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> StreamParser {
        StreamParser::new(Arc::new(MarkerGrammar::default()), TextMode::Live)
    }

    fn feed_all(parser: &mut StreamParser, input: &str) -> Vec<AgentEvent> {
        let mut events = parser.feed(Channel::Stdout, input.as_bytes());
        events.extend(parser.finish());
        events
    }

    /// Concatenate stdout text and list every other event kind, in order.
    fn summarize(events: &[AgentEvent]) -> (String, Vec<AgentEvent>) {
        let mut text = String::new();
        let mut others = Vec::new();
        for event in events {
            match event {
                AgentEvent::Stdout(p) => text.push_str(&p.text),
                other => others.push(other.clone()),
            }
        }
        (text, others)
    }

    const SESSION_STREAM: &str = concat!(
        r#"{"type":"system","subtype":"init","session_id":"sess-1","model":"claude-sonnet-4"}"#,
        "\n",
        r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Looking at the code."}],"usage":{"input_tokens":10,"output_tokens":4}}}"#,
        "\n",
        r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"/p/src/lib.rs"}}],"usage":{"input_tokens":10,"output_tokens":4}}}"#,
        "\n",
        r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":"fn main() {}"}]}}"#,
        "\n",
        r#"{"type":"assistant","message":{"id":"m2","content":[{"type":"text","text":"Done."}],"usage":{"input_tokens":20,"output_tokens":6}}}"#,
        "\n",
        r#"{"type":"result","subtype":"success","result":"Done.","usage":{"input_tokens":30,"output_tokens":12},"total_cost_usd":0.02}"#,
        "\n",
    );

    #[test]
    fn test_session_stream_maps_records_to_events() {
        let mut p = parser();
        let events = feed_all(&mut p, SESSION_STREAM);
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "session", "stdout", "usage", "tool_call", "tool_result", "stdout", "usage", "usage"
            ]
        );

        match &events[0] {
            AgentEvent::Session(s) => {
                assert_eq!(s.session_id, "sess-1");
                assert_eq!(s.model.as_deref(), Some("claude-sonnet-4"));
            }
            other => panic!("Expected Session, got {:?}", other),
        }
        match &events[3] {
            AgentEvent::ToolCall(call) => {
                assert_eq!(call.name, "Read");
                assert_eq!(call.summary, "Reading: src/lib.rs");
            }
            other => panic!("Expected ToolCall, got {:?}", other),
        }

        // m1 usage counted once, m2 added, result totals reconciled.
        let usage = p.usage();
        assert_eq!(usage.input_tokens, 30);
        assert_eq!(usage.output_tokens, 12);
        assert_eq!(usage.cost_usd, Some(0.02));
        assert_eq!(usage.model.as_deref(), Some("claude-sonnet-4"));
        assert_eq!(p.response_text(), "Looking at the code.\n\nDone.");
    }

    #[test]
    fn test_session_emitted_once() {
        let mut p = parser();
        let line = r#"{"type":"system","subtype":"init","session_id":"sess-1"}"#;
        let events = feed_all(&mut p, &format!("{}\n{}\n", line, line));
        assert_eq!(events.iter().filter(|e| e.kind() == "session").count(), 1);
    }

    #[test]
    fn test_plain_text_and_non_record_json_are_stdout() {
        let mut p = parser();
        let events = feed_all(&mut p, "hello world\n{\"key\": 1}\n");
        let (text, others) = summarize(&events);
        assert_eq!(text, "hello world\n{\"key\": 1}\n");
        assert!(others.is_empty());
    }

    #[test]
    fn test_malformed_record_is_text() {
        let mut p = parser();
        let events = feed_all(&mut p, "{\"type\":\"assistant\",\"message\":\n");
        let (text, _) = summarize(&events);
        assert_eq!(text, "{\"type\":\"assistant\",\"message\":\n");
    }

    #[test]
    fn test_crlf_and_trailing_partial_line() {
        let mut p = parser();
        let events = feed_all(&mut p, "one\r\ntwo");
        let (text, _) = summarize(&events);
        assert_eq!(text, "one\ntwo");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut p = parser();
        let mut events = p.feed(Channel::Stdout, b"bad \xff byte\n");
        events.extend(p.finish());
        let (text, _) = summarize(&events);
        assert_eq!(text, "bad \u{fffd} byte\n");
    }

    #[test]
    fn test_stderr_is_plain_text() {
        let mut p = parser();
        let mut events = p.feed(Channel::Stderr, b"warning: low disk\n");
        events.extend(p.finish());
        let (text, _) = summarize(&events);
        assert_eq!(text, "warning: low disk\n");
        assert_eq!(p.stderr_tail(), "warning: low disk");
    }

    #[test]
    fn test_split_anywhere_equivalence() {
        let input = format!(
            "{}before <thinking>plan it</thinking> after\n<permission_request>{{\"tool\":\"Bash\",\"message\":\"rm -rf build\"}}</permission_request>\ntail",
            SESSION_STREAM
        );
        let whole = {
            let mut p = parser();
            summarize(&feed_all(&mut p, &input))
        };

        let bytes = input.as_bytes();
        for split in 1..bytes.len() {
            let mut p = parser();
            let mut events = p.feed(Channel::Stdout, &bytes[..split]);
            events.extend(p.feed(Channel::Stdout, &bytes[split..]));
            events.extend(p.finish());
            assert_eq!(summarize(&events), whole, "split at {}", split);
        }

        // And one byte at a time.
        let mut p = parser();
        let mut events = Vec::new();
        for b in bytes {
            events.extend(p.feed(Channel::Stdout, std::slice::from_ref(b)));
        }
        events.extend(p.finish());
        assert_eq!(summarize(&events), whole);
    }

    #[test]
    fn test_markers_in_plain_text() {
        let mut p = parser();
        let events = feed_all(
            &mut p,
            "a <permission_request>{\"tool\":\"Bash\",\"message\":\"run tests\"}</permission_request> b\n",
        );
        let (text, others) = summarize(&events);
        assert_eq!(text, "a  b\n");
        assert_eq!(
            others,
            vec![AgentEvent::PermissionRequest(PermissionPayload {
                tool: Some("Bash".into()),
                message: "run tests".into(),
            })]
        );
    }

    #[test]
    fn test_unterminated_marker_flushed_as_text() {
        let mut p = parser();
        let events = feed_all(&mut p, "x <thinking>never closed");
        let (text, others) = summarize(&events);
        assert_eq!(text, "x <thinking>never closed");
        assert!(others.is_empty());
    }

    #[test]
    fn test_task_tool_brackets_subagent() {
        let input = concat!(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"task-1","name":"Task","input":{"description":"scan tests","prompt":"..."}}]}}"#,
            "\n",
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"task-1","content":[{"type":"text","text":"3 failing"}]}]}}"#,
            "\n",
        );
        let mut p = parser();
        let events = feed_all(&mut p, input);
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["tool_call", "subagent_start", "tool_result", "subagent_end"]
        );
        match &events[3] {
            AgentEvent::SubagentEnd(end) => {
                assert_eq!(end.id.as_deref(), Some("task-1"));
                assert_eq!(end.result.as_deref(), Some("3 failing"));
            }
            other => panic!("Expected SubagentEnd, got {:?}", other),
        }
    }

    #[test]
    fn test_streamed_deltas_are_not_repeated() {
        let input = concat!(
            r#"{"type":"stream_event","event":{"type":"message_start","message":{}}}"#,
            "\n",
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}}"#,
            "\n",
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}}"#,
            "\n",
            r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"text","text":"Hello"}]}}"#,
            "\n",
        );
        let mut p = parser();
        let (text, _) = summarize(&feed_all(&mut p, input));
        assert_eq!(text, "Hello");
        assert_eq!(p.response_text(), "Hello");
    }

    #[test]
    fn test_result_text_used_when_no_assistant_text() {
        let mut p = parser();
        let events = feed_all(
            &mut p,
            "{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"All done\"}\n",
        );
        let (text, _) = summarize(&events);
        assert_eq!(text, "All done");
        assert_eq!(p.response_text(), "All done");
    }

    #[test]
    fn test_result_error_is_recorded() {
        let mut p = parser();
        feed_all(
            &mut p,
            "{\"type\":\"result\",\"subtype\":\"error_max_turns\",\"is_error\":true}\n",
        );
        assert_eq!(p.result_error(), Some("error_max_turns"));
    }

    #[test]
    fn test_held_mode_emits_no_text() {
        let mut p = StreamParser::new(Arc::new(MarkerGrammar::default()), TextMode::Held);
        let events = feed_all(&mut p, &format!("{}raw line\n", SESSION_STREAM));
        assert!(events.iter().all(|e| e.kind() != "stdout"));
        assert!(events.iter().any(|e| e.kind() == "session"));

        let held = p.take_held();
        assert!(held.response.contains("Looking at the code."));
        assert!(!held.response.contains("raw line"));
        assert_eq!(held.diagnostics, "raw line\n");

        let released = p.release("clean <thinking>hm</thinking>text");
        let kinds: Vec<&str> = released.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["stdout", "thinking", "stdout"]);
    }

    #[test]
    fn test_held_plain_stdout_is_the_response() {
        let mut p = StreamParser::new(Arc::new(MarkerGrammar::default()), TextMode::Held);
        p.feed(Channel::Stdout, b"the answer\n");
        p.feed(Channel::Stderr, b"warning: deprecated flag\n");
        p.finish();

        let held = p.take_held();
        assert_eq!(held.response, "the answer\n");
        assert_eq!(held.diagnostics, "warning: deprecated flag\n");
    }

    #[test]
    fn test_stderr_is_not_part_of_the_response() {
        let mut p = parser();
        p.feed(Channel::Stderr, b"warning: deprecated flag\n");
        p.feed(Channel::Stdout, b"the answer\n");
        p.finish();
        assert_eq!(p.response_text(), "the answer");
    }

    #[test]
    fn test_long_line_across_many_chunks() {
        let mut p = parser();
        let line = "x".repeat(100_000);
        let mut events = Vec::new();
        for chunk in line.as_bytes().chunks(8 * 1024) {
            events.extend(p.feed(Channel::Stdout, chunk));
        }
        assert!(events.is_empty());
        events.extend(p.feed(Channel::Stdout, b"\nnext\n"));
        let (text, _) = summarize(&events);
        assert_eq!(text, format!("{}\nnext\n", line));
    }

    #[test]
    fn test_signal_event_plain_body() {
        match signal_event(SignalKind::SubagentStart, " exploring ") {
            AgentEvent::SubagentStart(start) => {
                assert_eq!(start.description, "exploring");
                assert!(start.id.is_none());
            }
            other => panic!("Expected SubagentStart, got {:?}", other),
        }
        match signal_event(SignalKind::ToolCall, r#"{"name":"Bash","input":{"command":"ls"}}"#) {
            AgentEvent::ToolCall(call) => {
                assert_eq!(call.name, "Bash");
                assert_eq!(call.summary, "Running: ls");
            }
            other => panic!("Expected ToolCall, got {:?}", other),
        }
    }
}
