use serde::Serialize;

/// Placeholder painted into the display history while a response streams.
/// The authoritative conversation never contains this text.
pub const TYPING_PLACEHOLDER: &str = "typing...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Conversation state: the authoritative message sequence sent to the engine,
/// plus a render-facing display copy that may diverge while a response is
/// still streaming. Append-only, except for in-place rewrites of the trailing
/// display entry. Single writer (the UI event loop), so no locking.
pub struct Transcript {
    conversation: Vec<Message>,
    display: Vec<Message>,
}

impl Transcript {
    pub fn new(system_prompt: &str) -> Self {
        Self {
            conversation: vec![Message::new(Role::System, system_prompt)],
            display: Vec::new(),
        }
    }

    /// Appends to both the authoritative conversation and the display history.
    pub fn push(&mut self, message: Message) {
        self.conversation.push(message.clone());
        self.display.push(message);
    }

    /// Appends to the display history only. Used for the streaming placeholder.
    pub fn push_display(&mut self, message: Message) {
        self.display.push(message);
    }

    /// Rewrites the content of the last display entry. The authoritative
    /// conversation is never touched here.
    pub fn replace_last_display(&mut self, content: &str) {
        if let Some(last) = self.display.last_mut() {
            last.content = content.to_string();
        }
    }

    /// Records the engine's canonical final text: appended to the
    /// authoritative conversation and mirrored into the trailing display entry.
    pub fn commit_assistant(&mut self, content: &str) {
        self.conversation
            .push(Message::new(Role::Assistant, content));
        self.replace_last_display(content);
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    pub fn display(&self) -> &[Message] {
        &self.display
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_appends_to_both_sequences() {
        let mut transcript = Transcript::new("You are a helpful AI agent helping users.");
        transcript.push(Message::new(Role::User, "hi"));

        assert_eq!(transcript.conversation().len(), 2);
        assert_eq!(transcript.display().len(), 1);
        assert_eq!(transcript.display()[0].content, "hi");
        assert_eq!(transcript.conversation()[1].content, "hi");
    }

    #[test]
    fn replace_last_display_leaves_conversation_untouched() {
        let mut transcript = Transcript::new("system");
        transcript.push(Message::new(Role::User, "hi"));
        transcript.push_display(Message::new(Role::Assistant, TYPING_PLACEHOLDER));

        transcript.replace_last_display("He");
        transcript.replace_last_display("Hello");

        assert_eq!(transcript.display().last().unwrap().content, "Hello");
        // Authoritative side still has only system + user.
        assert_eq!(transcript.conversation().len(), 2);
        assert!(transcript
            .conversation()
            .iter()
            .all(|m| m.role != Role::Assistant));
    }

    #[test]
    fn placeholder_never_reaches_conversation() {
        let mut transcript = Transcript::new("system");
        transcript.push(Message::new(Role::User, "hi"));
        transcript.push_display(Message::new(Role::Assistant, TYPING_PLACEHOLDER));
        transcript.commit_assistant("Hello!");

        assert!(transcript
            .conversation()
            .iter()
            .all(|m| m.content != TYPING_PLACEHOLDER));
        assert_eq!(transcript.conversation().last().unwrap().content, "Hello!");
        assert_eq!(transcript.display().last().unwrap().content, "Hello!");
    }

    #[test]
    fn replace_last_display_on_empty_history_is_a_noop() {
        let mut transcript = Transcript::new("system");
        transcript.replace_last_display("orphan");
        assert!(transcript.display().is_empty());
    }

    #[test]
    fn role_serializes_lowercase() {
        let msg = Message::new(Role::Assistant, "hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
