//! Support-handoff sentinel embedded in AI replies.
//!
//! The responder requests a handoff by including [`HANDOFF_MARKER`] anywhere
//! in its reply. The marker is matched case-insensitively, every occurrence is
//! removed, and the remaining text is what the customer sees.

/// Reserved token an AI reply uses to request a support handoff.
pub const HANDOFF_MARKER: &str = "[[HANDOFF:SUPPORT]]";

/// Sent when the reply consisted of nothing but the marker.
pub const DEFAULT_HANDOFF_REPLY: &str =
    "Thanks for your patience. A member of our support team will continue this conversation shortly.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `HandoffRequest` values.
pub enum HandoffRequest {
    Support,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `ParsedAiReply` used across chatbridge components.
pub struct ParsedAiReply {
    pub text: String,
    pub handoff: Option<HandoffRequest>,
}

pub fn parse_ai_reply(raw: &str) -> ParsedAiReply {
    let (stripped, found) = strip_marker(raw);
    if !found {
        return ParsedAiReply {
            text: raw.trim().to_string(),
            handoff: None,
        };
    }
    let text = collapse_blank_runs(&stripped);
    ParsedAiReply {
        text: if text.is_empty() {
            DEFAULT_HANDOFF_REPLY.to_string()
        } else {
            text
        },
        handoff: Some(HandoffRequest::Support),
    }
}

fn strip_marker(raw: &str) -> (String, bool) {
    // ASCII-only lowering keeps byte offsets aligned with `raw`.
    let haystack = raw.to_ascii_lowercase();
    let needle = HANDOFF_MARKER.to_ascii_lowercase();
    let mut output = String::with_capacity(raw.len());
    let mut cursor = 0;
    let mut found = false;
    while let Some(offset) = haystack[cursor..].find(&needle) {
        let start = cursor + offset;
        output.push_str(&raw[cursor..start]);
        cursor = start + needle.len();
        found = true;
    }
    output.push_str(&raw[cursor..]);
    (output, found)
}

fn collapse_blank_runs(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
