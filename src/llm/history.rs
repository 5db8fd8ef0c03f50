//! Conversation history shaping before it is sent to providers.

use super::providers::{Message, Role};

/// Most recent messages a provider sees.
pub const MAX_CONVERSATION_HISTORY: usize = 20;

/// Longest conversation title before truncation.
pub const MAX_TITLE_CHARS: usize = 50;

/// Picks one reply out of the several assistant replies a fan-out stored
/// for a single user turn.
pub trait ResponseReducer: Send + Sync {
    fn name(&self) -> &'static str;

    /// `replies` is never empty and is in storage order
    fn pick<'a>(&self, replies: &[&'a Message]) -> &'a Message;
}

/// Keeps the longest reply; the earliest one wins a tie.
#[derive(Debug, Default, Clone, Copy)]
pub struct LongestResponse;

impl ResponseReducer for LongestResponse {
    fn name(&self) -> &'static str {
        "longest"
    }

    fn pick<'a>(&self, replies: &[&'a Message]) -> &'a Message {
        let mut best = replies[0];
        for reply in &replies[1..] {
            if reply.content.chars().count() > best.content.chars().count() {
                best = reply;
            }
        }
        best
    }
}

/// Keeps the most recently stored reply.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestResponse;

impl ResponseReducer for LatestResponse {
    fn name(&self) -> &'static str {
        "latest"
    }

    fn pick<'a>(&self, replies: &[&'a Message]) -> &'a Message {
        replies[replies.len() - 1]
    }
}

pub fn reducer_by_name(name: &str) -> Option<Box<dyn ResponseReducer>> {
    match name {
        "longest" => Some(Box::new(LongestResponse)),
        "latest" => Some(Box::new(LatestResponse)),
        _ => None,
    }
}

/// Collapse each run of assistant replies into one and keep the last `max`
/// messages. System messages are dropped; providers get their system prompt
/// separately.
pub fn compact_history(messages: &[Message], reducer: &dyn ResponseReducer, max: usize) -> Vec<Message> {
    let mut compacted: Vec<Message> = Vec::new();
    let mut run: Vec<&Message> = Vec::new();

    for message in messages {
        match message.role {
            Role::Assistant => run.push(message),
            Role::User => {
                if !run.is_empty() {
                    compacted.push(reducer.pick(&run).clone());
                    run.clear();
                }
                compacted.push(message.clone());
            }
            Role::System => {}
        }
    }
    if !run.is_empty() {
        compacted.push(reducer.pick(&run).clone());
    }

    let skip = compacted.len().saturating_sub(max);
    compacted.split_off(skip)
}

/// Title derived from the first prompt of a conversation.
pub fn conversation_title(prompt: &str) -> String {
    let prompt = prompt.trim();
    if prompt.chars().count() <= MAX_TITLE_CHARS {
        return prompt.to_string();
    }
    let mut title: String = prompt.chars().take(MAX_TITLE_CHARS).collect();
    title.push_str("...");
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fan_out_turn(prompt: &str, replies: &[&str]) -> Vec<Message> {
        let mut turn = vec![Message::user(prompt)];
        turn.extend(replies.iter().map(|r| Message::assistant(*r)));
        turn
    }

    #[test]
    fn test_longest_keeps_one_reply_per_turn() {
        let mut history = fan_out_turn("q1", &["short", "the longest one", "medium one"]);
        history.extend(fan_out_turn("q2", &["a", "bb"]));

        let compacted = compact_history(&history, &LongestResponse, MAX_CONVERSATION_HISTORY);
        assert_eq!(
            compacted,
            vec![
                Message::user("q1"),
                Message::assistant("the longest one"),
                Message::user("q2"),
                Message::assistant("bb"),
            ]
        );
    }

    #[test]
    fn test_longest_tie_prefers_first() {
        let history = fan_out_turn("q", &["abc", "xyz"]);
        let compacted = compact_history(&history, &LongestResponse, 10);
        assert_eq!(compacted[1].content, "abc");
    }

    #[test]
    fn test_latest_reducer() {
        let history = fan_out_turn("q", &["first", "a much longer second", "third"]);
        let compacted = compact_history(&history, &LatestResponse, 10);
        assert_eq!(compacted[1].content, "third");
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let mut history = Vec::new();
        for i in 0..15 {
            history.extend(fan_out_turn(&format!("q{}", i), &["r"]));
        }

        let compacted = compact_history(&history, &LongestResponse, MAX_CONVERSATION_HISTORY);
        assert_eq!(compacted.len(), 20);
        assert_eq!(compacted[0], Message::user("q5"));
        assert_eq!(compacted[19], Message::assistant("r"));
    }

    #[test]
    fn test_system_messages_dropped() {
        let history = vec![Message::system("sys"), Message::user("hi")];
        assert_eq!(compact_history(&history, &LongestResponse, 5), vec![Message::user("hi")]);
    }

    #[test]
    fn test_reducer_by_name() {
        assert_eq!(reducer_by_name("latest").unwrap().name(), "latest");
        assert!(reducer_by_name("random").is_none());
    }

    #[test]
    fn test_conversation_title() {
        assert_eq!(conversation_title("  short prompt "), "short prompt");

        let long = "x".repeat(60);
        let title = conversation_title(&long);
        assert_eq!(title.chars().count(), 53);
        assert!(title.ends_with("..."));
    }
}
