//! Chat prompt templates.

use serde::{Deserialize, Serialize};

/// Turn formatting understood by the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatTemplate {
    /// `<|system|>` / `<|user|>` / `<|assistant|>` tags
    #[default]
    Zephyr,
    /// `<|im_start|>role ... <|im_end|>` blocks
    ChatMl,
}

impl ChatTemplate {
    /// Parse a template name as written in config files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "zephyr" => Some(ChatTemplate::Zephyr),
            "chatml" => Some(ChatTemplate::ChatMl),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChatTemplate::Zephyr => "zephyr",
            ChatTemplate::ChatMl => "chatml",
        }
    }

    /// Format the system prompt that becomes the window anchor.
    pub fn system_block(&self, system: &str) -> String {
        match self {
            ChatTemplate::Zephyr => format!("<s><|system|>\n{}", system),
            ChatTemplate::ChatMl => format!("<|im_start|>system\n{}<|im_end|>", system),
        }
    }

    /// Format one user turn and open the assistant reply.
    pub fn user_turn(&self, content: &str) -> String {
        match self {
            ChatTemplate::Zephyr => format!("\n<|user|>\n{}\n<|assistant|>\n", content),
            ChatTemplate::ChatMl => format!(
                "\n<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
                content
            ),
        }
    }

    /// Format a user turn with an injected context block ahead of the message.
    pub fn user_turn_with_context(&self, content: &str, context: &str) -> String {
        let body = format!("<|context|>\n{}\n</context|>\n{}", context, content);
        self.user_turn(&body)
    }

    /// Text that signals the model has started writing the next user turn.
    pub fn runaway_marker(&self) -> &'static str {
        match self {
            ChatTemplate::Zephyr => "<|user|>",
            ChatTemplate::ChatMl => "<|im_start|>user",
        }
    }

    /// Cut a raw response at the runaway marker and trim trailing whitespace.
    pub fn clean_response(&self, raw: &str) -> String {
        let cut = match raw.find(self.runaway_marker()) {
            Some(index) => &raw[..index],
            None => raw,
        };
        cut.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zephyr_user_turn() {
        let prompt = ChatTemplate::Zephyr.user_turn("hello");
        assert_eq!(prompt, "\n<|user|>\nhello\n<|assistant|>\n");
    }

    #[test]
    fn test_chatml_system_block() {
        let block = ChatTemplate::ChatMl.system_block("Be brief.");
        assert_eq!(block, "<|im_start|>system\nBe brief.<|im_end|>");
    }

    #[test]
    fn test_context_block() {
        let prompt = ChatTemplate::Zephyr.user_turn_with_context("what now?", "it is raining");
        assert!(prompt.contains("<|context|>\nit is raining\n</context|>\nwhat now?"));
    }

    #[test]
    fn test_clean_response_cuts_runaway() {
        let raw = "Sure thing.  \n<|user|>\nand another";
        assert_eq!(ChatTemplate::Zephyr.clean_response(raw), "Sure thing.");
        assert_eq!(ChatTemplate::ChatMl.clean_response("done \n"), "done");
    }

    #[test]
    fn test_from_name() {
        assert_eq!(ChatTemplate::from_name("ChatML"), Some(ChatTemplate::ChatMl));
        assert_eq!(ChatTemplate::from_name("alpaca"), None);
    }
}
