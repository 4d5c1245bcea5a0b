use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::completion::ToolCall;

/// Handle for memory shared between several agents of a collaboration.
pub type SharedMemory = Arc<Mutex<Memory>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::parse(s).ok_or_else(|| format!("unknown role: {s}"))
    }
}

/// One conversation entry, as stored in memory and sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant turn that requested tool calls.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content.unwrap_or_default())
        }
    }

    /// Result of a tool call, linked back to the request by id.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            name: Some(tool.into()),
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn token_estimate(&self) -> usize {
        estimate_tokens(&self.content)
    }
}

/// Rough token count, about four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Portable `{role, content}` form used by export and import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub entries: usize,
    pub capacity: usize,
    pub estimated_tokens: usize,
    pub system: usize,
    pub user: usize,
    pub assistant: usize,
    pub tool: usize,
    /// Distinct tool names seen in tool results, first use first.
    pub tools_used: Vec<String>,
    /// Named non-tool entries per author, first appearance first.
    pub contributions: IndexMap<String, usize>,
}

/// Bounded conversation history.
///
/// Holds at most `capacity` entries. Overflow evicts the oldest non-system
/// entry; only when every entry is a system entry does the oldest one go.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    entries: VecDeque<Message>,
    capacity: usize,
}

impl Memory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn shared(capacity: usize) -> SharedMemory {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_back(message);
        while self.entries.len() > self.capacity {
            self.evict_one();
        }
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.push(message);
        }
    }

    /// Evicting an assistant turn that requested tools also evicts the tool
    /// results answering it, so history never opens on an orphan result.
    fn evict_one(&mut self) {
        let Some(idx) = self.entries.iter().position(|m| m.role != Role::System) else {
            self.entries.pop_front();
            return;
        };
        let Some(evicted) = self.entries.remove(idx) else {
            return;
        };
        if !evicted.tool_calls.is_empty() {
            self.entries.retain(|m| {
                m.role != Role::Tool
                    || !m
                        .tool_call_id
                        .as_deref()
                        .is_some_and(|id| evicted.tool_calls.iter().any(|call| call.id == id))
            });
        }
        self.drop_leading_tool_results();
    }

    fn drop_leading_tool_results(&mut self) {
        while let Some(idx) = self.entries.iter().position(|m| m.role != Role::System) {
            if self.entries[idx].role != Role::Tool {
                break;
            }
            self.entries.remove(idx);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn export(&self) -> Vec<MemoryRecord> {
        self.entries
            .iter()
            .map(|m| MemoryRecord {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }

    /// Append records in order, subject to the usual bound.
    pub fn import(&mut self, records: impl IntoIterator<Item = MemoryRecord>) {
        for record in records {
            self.push(Message::new(record.role, record.content));
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats {
            entries: self.entries.len(),
            capacity: self.capacity,
            ..MemoryStats::default()
        };
        for message in &self.entries {
            stats.estimated_tokens += message.token_estimate();
            match message.role {
                Role::System => stats.system += 1,
                Role::User => stats.user += 1,
                Role::Assistant => stats.assistant += 1,
                Role::Tool => stats.tool += 1,
            }
            let Some(name) = &message.name else {
                continue;
            };
            if message.role == Role::Tool {
                if !stats.tools_used.contains(name) {
                    stats.tools_used.push(name.clone());
                }
            } else {
                *stats.contributions.entry(name.clone()).or_default() += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_entries_in_order() {
        let mut memory = Memory::new(3);
        for turn in 1..=5 {
            memory.push(Message::user(format!("turn {turn}")));
        }
        let contents: Vec<_> = memory.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 3", "turn 4", "turn 5"]);
    }

    #[test]
    fn evicts_non_system_entries_first() {
        let mut memory = Memory::new(3);
        memory.push(Message::system("rules"));
        memory.push(Message::user("a"));
        memory.push(Message::assistant("b"));
        memory.push(Message::user("c"));

        let roles: Vec<_> = memory.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::Assistant, Role::User]);
        assert_eq!(memory.iter().next().unwrap().content, "rules");
    }

    #[test]
    fn all_system_entries_evict_oldest() {
        let mut memory = Memory::new(2);
        memory.push(Message::system("one"));
        memory.push(Message::system("two"));
        memory.push(Message::system("three"));
        let contents: Vec<_> = memory.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);
    }

    #[test]
    fn zero_capacity_disables_storage() {
        let mut memory = Memory::new(0);
        memory.push(Message::user("hello"));
        assert!(memory.is_empty());
    }

    #[test]
    fn export_import_preserves_order() {
        let mut memory = Memory::new(10);
        memory.push(Message::user("question"));
        memory.push(Message::assistant("answer"));
        let records = memory.export();

        let mut restored = Memory::new(10);
        restored.import(records.clone());
        assert_eq!(restored.export(), records);
        assert_eq!(records[0].role, Role::User);
    }

    #[test]
    fn stats_count_roles_and_tools() {
        let mut memory = Memory::new(10);
        memory.push(Message::user("weather in Oslo?"));
        memory.push(Message::assistant_tool_calls(
            None,
            vec![ToolCall::new("call-1", "forecast", serde_json::json!({}))],
        ));
        memory.push(Message::tool_result("call-1", "forecast", "sunny"));
        memory.push(Message::tool_result("call-2", "forecast", "rain"));
        memory.push(Message::assistant("It is sunny."));

        let stats = memory.stats();
        assert_eq!(stats.entries, 5);
        assert_eq!(stats.capacity, 10);
        assert_eq!(stats.user, 1);
        assert_eq!(stats.assistant, 2);
        assert_eq!(stats.tool, 2);
        assert_eq!(stats.tools_used, vec!["forecast".to_string()]);
        assert!(stats.estimated_tokens > 0);
    }

    #[test]
    fn tool_turn_is_evicted_whole() {
        let mut memory = Memory::new(2);
        memory.push(Message::user("weather?"));
        memory.push(Message::assistant_tool_calls(
            None,
            vec![ToolCall::new("c1", "forecast", serde_json::json!({}))],
        ));
        memory.push(Message::tool_result("c1", "forecast", "sunny"));
        memory.push(Message::assistant("done"));

        let roles: Vec<_> = memory.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::Assistant]);
        memory.push(Message::user("next"));
        assert_eq!(memory.len(), 2);
        assert!(memory.iter().all(|m| m.role != Role::Tool));
    }

    #[test]
    fn leading_tool_results_are_dropped() {
        let mut memory = Memory::new(2);
        memory.push(Message::system("rules"));
        memory.push(Message::user("a"));
        memory.push(Message::tool_result("stale", "forecast", "old"));

        let roles: Vec<_> = memory.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System]);
    }

    #[test]
    fn stats_count_contributions_per_author() {
        let mut memory = Memory::new(10);
        memory.push(Message::assistant("draft").with_name("Writer"));
        memory.push(Message::assistant("numbers").with_name("Analyst"));
        memory.push(Message::assistant("final").with_name("Writer"));
        memory.push(Message::tool_result("c1", "forecast", "sunny"));

        let contributions = memory.stats().contributions;
        let counts: Vec<_> = contributions.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        assert_eq!(counts, vec![("Writer", 2), ("Analyst", 1)]);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn role_parsing() {
        assert_eq!("Assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!(Role::parse("narrator").is_none());
        assert_eq!(Role::Tool.to_string(), "tool");
    }
}
