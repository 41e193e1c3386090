//! Wire types: the line-framed message envelope, the command envelope the
//! host sends to a child, and the command descriptor a child announces back
//! (§3, §6 of the protocol this crate implements).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The tag carried in every line's `type` field. `Other` preserves unknown
/// tags verbatim so dispatch can miss silently without treating the line as
/// malformed (§6: "Unknown `type` values: dispatch lookup misses silently").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ready,
    Log,
    Event,
    LifecycleEvent,
    Command,
    Response,
    CommandRegistry,
    SystemPrompt,
    AgentDescription,
    CommandProgress,
    SidebarSection,
    SidebarSectionRemoval,
    Error,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Ready => "ready",
            MessageType::Log => "log",
            MessageType::Event => "event",
            MessageType::LifecycleEvent => "lifecycle_event",
            MessageType::Command => "command",
            MessageType::Response => "response",
            MessageType::CommandRegistry => "command_registry",
            MessageType::SystemPrompt => "system_prompt",
            MessageType::AgentDescription => "agent_description",
            MessageType::CommandProgress => "command_progress",
            MessageType::SidebarSection => "sidebar_section",
            MessageType::SidebarSectionRemoval => "sidebar_section_removal",
            MessageType::Error => "error",
            MessageType::Other(s) => s.as_str(),
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ready" => MessageType::Ready,
            "log" => MessageType::Log,
            "event" => MessageType::Event,
            "lifecycle_event" => MessageType::LifecycleEvent,
            "command" => MessageType::Command,
            "response" => MessageType::Response,
            "command_registry" => MessageType::CommandRegistry,
            "system_prompt" => MessageType::SystemPrompt,
            "agent_description" => MessageType::AgentDescription,
            "command_progress" => MessageType::CommandProgress,
            "sidebar_section" => MessageType::SidebarSection,
            "sidebar_section_removal" => MessageType::SidebarSectionRemoval,
            "error" => MessageType::Error,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(MessageType::from_str(&s))
    }
}

/// One line on the wire: `{ "type": ..., "timestamp": ..., "data": ... }`.
/// `timestamp` is fixed at envelope-creation time (`Message::new`), not at
/// write time, so in-flight reordering is semantically irrelevant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Message {
    pub fn new(message_type: MessageType, data: Value) -> Self {
        Message {
            message_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Sent host→child. `id` is generated by the sender and used to correlate
/// the eventual `response` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default)]
    pub args: HashMap<String, Value>,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl Command {
    pub fn new(command: impl Into<String>, args: HashMap<String, Value>) -> Self {
        Command {
            command: command.into(),
            args,
            id: Uuid::new_v4().to_string(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }
}

/// One declared argument of a `CommandDescriptor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgumentType {
    pub name: String,
    #[serde(default = "default_argument_kind")]
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

fn default_argument_kind() -> String {
    "string".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExposeAs {
    AgentTool,
    SlashCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlashScope {
    Global,
    Local,
}

/// A command as announced by the child in a `command_registry` message,
/// before normalization (see `normalize_descriptor`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub expose_as: Vec<ExposeAs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slash_command: Option<String>,
    #[serde(default)]
    pub slash_scope: Option<SlashScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_hint: Option<String>,
    #[serde(default)]
    pub argument_required: bool,
    #[serde(default)]
    pub arguments: Vec<ArgumentType>,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_label: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

/// Normalizes a raw descriptor per §3: fills defaults, derives a title when
/// absent, normalizes `slash_command`, and de-duplicates arguments by first
/// occurrence of `name`.
pub fn normalize_descriptor(mut descriptor: CommandDescriptor) -> CommandDescriptor {
    descriptor.name = descriptor.name.trim().to_string();

    if descriptor.title.as_deref().map(str::trim).unwrap_or("").is_empty() {
        descriptor.title = Some(derive_title(&descriptor.name));
    }

    if descriptor.expose_as.is_empty() {
        descriptor.expose_as = vec![ExposeAs::AgentTool];
    }

    if descriptor.slash_scope.is_none() {
        descriptor.slash_scope = Some(SlashScope::Local);
    }

    if let Some(raw) = descriptor.slash_command.take() {
        descriptor.slash_command = Some(normalize_slash_command(&raw));
    }

    let mut seen = std::collections::HashSet::new();
    descriptor.arguments.retain(|arg| seen.insert(arg.name.clone()));
    for arg in &mut descriptor.arguments {
        if arg.kind.trim().is_empty() {
            arg.kind = default_argument_kind();
        }
    }

    descriptor
}

/// Splits `name` on `_`, `-`, `:`, `.`, whitespace, camelCase boundaries,
/// and letter→digit boundaries, then title-cases each word and joins with
/// single spaces (§3, §4.4, §8 property 8).
pub fn derive_title(name: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();

    let chars: Vec<char> = name.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        let is_delim = matches!(c, '_' | '-' | ':' | '.') || c.is_whitespace();
        if is_delim {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }

        if i > 0 {
            let prev = chars[i - 1];
            let camel_boundary = prev.is_lowercase() && c.is_uppercase();
            let digit_boundary = (prev.is_alphabetic() && c.is_ascii_digit())
                || (prev.is_ascii_digit() && c.is_alphabetic());
            if camel_boundary || digit_boundary {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
        }
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }

    words
        .into_iter()
        .filter(|w| !w.is_empty())
        .map(|w| {
            let lower = w.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalizes a raw `slash_command` value: lower-case, leading `/`, spaces
/// and `.` collapse to `_`, internal `/` are dropped, trailing `_` is
/// stripped, `-` and `:` are preserved. Idempotent (§8 property 7).
pub fn normalize_slash_command(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    let mut out = String::new();
    for c in lower.chars() {
        match c {
            '/' => continue,
            ' ' | '.' => out.push('_'),
            _ => out.push(c),
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    format!("/{}", out)
}
