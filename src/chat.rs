//! Caller-side chat model
//!
//! A conversation is an ordered list of messages. Asking for a reply adds an
//! empty assistant message that grows in place as fragments arrive, which is
//! what a chat view renders while the model is still writing.

use crate::error::Result;
use crate::session::Session;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Assistant,
}

/// One entry of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub kind: MessageKind,
    pub content: String,
    /// Where the image came from, for image messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    pub author: Author,
}

impl ChatMessage {
    pub fn user_text(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            content: content.into(),
            image_ref: None,
            author: Author::User,
        }
    }

    pub fn user_image(image_ref: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Image,
            content: String::new(),
            image_ref: Some(image_ref.into()),
            author: Author::User,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Text,
            content: content.into(),
            image_ref: None,
            author: Author::Assistant,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn push_user_text(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user_text(content));
    }

    pub fn push_user_image(&mut self, image_ref: impl Into<String>) {
        self.messages.push(ChatMessage::user_image(image_ref));
    }

    /// Text of the most recent user text message
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.author == Author::User && message.kind == MessageKind::Text)
            .map(|message| message.content.as_str())
    }

    /// Generate a reply to `prompt`, growing an assistant message in place
    ///
    /// On error the partial reply stays in the conversation.
    pub async fn reply(&mut self, session: &Session, prompt: &str) -> Result<String> {
        self.reply_with(session, prompt, |_| {}).await
    }

    /// Like [`Conversation::reply`], calling `on_update` with the reply text
    /// so far after every fragment
    pub async fn reply_with<F>(&mut self, session: &Session, prompt: &str, mut on_update: F) -> Result<String>
    where
        F: FnMut(&str),
    {
        self.messages.push(ChatMessage::assistant(""));
        let index = self.messages.len() - 1;

        let mut stream = session.generate(prompt);
        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            let message = &mut self.messages[index];
            message.content.push_str(&fragment);
            on_update(&message.content);
        }

        Ok(self.messages[index].content.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let message = ChatMessage::user_image("content://photos/42");
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"kind\":\"image\""));
        assert!(json.contains("\"author\":\"user\""));

        let text: ChatMessage =
            serde_json::from_str(r#"{"kind":"text","content":"hi","author":"assistant"}"#).unwrap();
        assert_eq!(text, ChatMessage::assistant("hi"));
    }

    #[test]
    fn test_last_user_text_skips_images_and_replies() {
        let mut conversation = Conversation::new();
        conversation.push_user_text("first");
        conversation.push_user_image("cat.jpg");
        assert_eq!(conversation.last_user_text(), Some("first"));
        assert_eq!(conversation.messages().len(), 2);
    }
}
