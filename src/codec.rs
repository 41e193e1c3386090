//! Line-delimited JSON codec (§4.2). One UTF-8 JSON object per line,
//! terminated by `\n`; readers tolerate a trailing `\r`. A line that fails
//! to decode is not an error at this layer — callers route it to a raw
//! handler instead of treating the stream as broken.

use std::fmt;

use crate::message::Message;

#[derive(Debug)]
pub enum CodecError {
    Decode(serde_json::Error),
    Encode(serde_json::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Decode(e) => write!(f, "failed to decode message: {e}"),
            CodecError::Encode(e) => write!(f, "failed to encode message: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Strips a trailing `\r` (from CRLF input) and surrounding whitespace is
/// intentionally NOT stripped beyond that — only line terminators are a
/// framing concern, not payload whitespace.
pub fn trim_line_ending(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

/// Decodes one line into a `Message`. Blank lines (after CRLF trim) should
/// be filtered by the caller before calling this; see `is_blank`.
pub fn decode_line(line: &str) -> Result<Message, CodecError> {
    serde_json::from_str(trim_line_ending(line)).map_err(CodecError::Decode)
}

pub fn is_blank(line: &str) -> bool {
    trim_line_ending(line).trim().is_empty()
}

/// Encodes a message as a single compact JSON line with exactly one
/// trailing `\n`. No pretty-printing.
pub fn encode_line(message: &Message) -> Result<String, CodecError> {
    let mut encoded = serde_json::to_string(message).map_err(CodecError::Encode)?;
    encoded.push('\n');
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::json;

    #[test]
    fn round_trips_every_known_message_type() {
        let tags = [
            MessageType::Ready,
            MessageType::Log,
            MessageType::Event,
            MessageType::LifecycleEvent,
            MessageType::Command,
            MessageType::Response,
            MessageType::CommandRegistry,
            MessageType::SystemPrompt,
            MessageType::AgentDescription,
            MessageType::CommandProgress,
            MessageType::SidebarSection,
            MessageType::SidebarSectionRemoval,
            MessageType::Error,
        ];
        for tag in tags {
            let msg = Message::new(tag, json!({"k": "v"}));
            let line = encode_line(&msg).unwrap();
            assert!(line.ends_with('\n'));
            let decoded = decode_line(line.trim_end_matches('\n')).unwrap();
            assert_eq!(decoded.message_type.as_str(), msg.message_type.as_str());
            assert_eq!(decoded.data, msg.data);
            assert_eq!(decoded.timestamp, msg.timestamp);
        }
    }

    #[test]
    fn unknown_type_round_trips_as_other() {
        let msg = Message::new(MessageType::from_str("some_future_tag"), json!(null));
        let line = encode_line(&msg).unwrap();
        let decoded = decode_line(line.trim_end_matches('\n')).unwrap();
        assert_eq!(decoded.message_type.as_str(), "some_future_tag");
    }

    #[test]
    fn malformed_line_is_decode_error_not_panic() {
        let err = decode_line("{not json").unwrap_err();
        matches!(err, CodecError::Decode(_));
    }

    #[test]
    fn trims_crlf_and_detects_blank() {
        assert_eq!(trim_line_ending("abc\r"), "abc");
        assert!(is_blank("   \r"));
        assert!(!is_blank("x"));
    }
}
