//! Mistral instruct prompt encoding.
//!
//! Conversations are rendered the way Mistral's v3 instruct tokenizer does it:
//!
//! ```text
//! <s>[INST] user [/INST] assistant</s>[INST] system\n\nuser [/INST]
//! ```
//!
//! Every piece of message content is tokenized on its own (without special
//! tokens) and the control tokens are inserted by id, so message text can
//! never be mistaken for template structure boundaries.
//!
//! Normalisation rules:
//! - system messages are joined with `"\n\n"` and prepended to the **last**
//!   user message;
//! - consecutive messages with the same role are merged with `"\n\n"`;
//! - the first non-system message must come from the user;
//! - a trailing assistant message is left open (no `</s>`) so the reply
//!   continues it.

use std::path::Path;
use std::sync::Arc;

use tokenizers::Tokenizer;
use tracing::debug;

use crate::chat::{ChatMessage, Role};
use crate::error::{EngineError, Result};

pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";
pub const INST_TOKEN: &str = "[INST]";
pub const INST_END_TOKEN: &str = "[/INST]";

const TURN_SEPARATOR: &str = "\n\n";

/// Ids of the control tokens used by the instruct template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: u32,
    pub eos: u32,
    pub inst: u32,
    pub inst_end: u32,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self> {
        let lookup = |token: &'static str| {
            tokenizer
                .token_to_id(token)
                .ok_or(EngineError::MissingSpecialToken { token })
        };
        Ok(Self {
            bos: lookup(BOS_TOKEN)?,
            eos: lookup(EOS_TOKEN)?,
            inst: lookup(INST_TOKEN)?,
            inst_end: lookup(INST_END_TOKEN)?,
        })
    }
}

/// A normalised conversation turn (system text already folded in).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Turn {
    role: Role,
    content: String,
}

/// Encodes chat conversations into prompt token ids and decodes generated ids.
#[derive(Debug, Clone)]
pub struct PromptEncoder {
    tokenizer: Arc<Tokenizer>,
    special: SpecialTokens,
}

impl PromptEncoder {
    /// Wrap an already loaded tokenizer, resolving the template's control tokens.
    pub fn new(tokenizer: Arc<Tokenizer>) -> Result<Self> {
        let special = SpecialTokens::resolve(&tokenizer)?;
        Ok(Self { tokenizer, special })
    }

    /// Load a `tokenizer.json` file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(EngineError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let tokenizer =
            Tokenizer::from_file(path).map_err(|e| EngineError::LoadTokenizer {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Self::new(Arc::new(tokenizer))
    }

    pub fn special_tokens(&self) -> SpecialTokens {
        self.special
    }

    pub fn tokenizer(&self) -> &Arc<Tokenizer> {
        &self.tokenizer
    }

    /// Render `messages` into the token sequence fed to the model.
    pub fn encode(&self, messages: &[ChatMessage]) -> Result<Vec<u32>> {
        let turns = normalize(messages)?;
        let last = turns.len() - 1;

        let mut tokens = vec![self.special.bos];
        for (index, turn) in turns.iter().enumerate() {
            match turn.role {
                Role::User => {
                    tokens.push(self.special.inst);
                    tokens.extend(self.encode_text(&turn.content)?);
                    tokens.push(self.special.inst_end);
                }
                Role::Assistant => {
                    tokens.extend(self.encode_text(&turn.content)?);
                    if index != last {
                        tokens.push(self.special.eos);
                    }
                }
                Role::System => unreachable!("system messages are folded by normalize"),
            }
        }

        debug!(
            messages = messages.len(),
            turns = turns.len(),
            prompt_tokens = tokens.len(),
            "encoded conversation"
        );
        Ok(tokens)
    }

    /// Tokenize plain text without adding any special tokens.
    pub fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let encoding = self.tokenizer.encode(text, false)?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode generated ids to text, dropping special tokens.
    pub fn decode(&self, tokens: &[u32]) -> Result<String> {
        Ok(self.tokenizer.decode(tokens, true)?)
    }
}

fn normalize(messages: &[ChatMessage]) -> Result<Vec<Turn>> {
    if messages.is_empty() {
        return Err(EngineError::InvalidConversation(
            "messages must not be empty".into(),
        ));
    }

    let mut system_parts: Vec<&str> = Vec::new();
    let mut turns: Vec<Turn> = Vec::new();

    for message in messages {
        if message.role == Role::System {
            system_parts.push(&message.content);
            continue;
        }
        match turns.last_mut() {
            Some(prev) if prev.role == message.role => {
                prev.content.push_str(TURN_SEPARATOR);
                prev.content.push_str(&message.content);
            }
            _ => turns.push(Turn {
                role: message.role,
                content: message.content.clone(),
            }),
        }
    }

    match turns.first() {
        None => {
            return Err(EngineError::InvalidConversation(
                "conversation must contain at least one user message".into(),
            ));
        }
        Some(first) if first.role != Role::User => {
            return Err(EngineError::InvalidConversation(
                "the first non-system message must have role `user`".into(),
            ));
        }
        Some(_) => {}
    }

    if !system_parts.is_empty() {
        let system = system_parts.join(TURN_SEPARATOR);
        // Non-empty and starting with a user turn, so a user turn exists.
        if let Some(turn) = turns.iter_mut().rev().find(|t| t.role == Role::User) {
            turn.content = format!("{system}{TURN_SEPARATOR}{}", turn.content);
        }
    }

    Ok(turns)
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::tiny_tokenizer;

    fn encoder() -> PromptEncoder {
        PromptEncoder::new(Arc::new(tiny_tokenizer())).expect("special tokens present")
    }

    fn ids(encoder: &PromptEncoder, words: &str) -> Vec<u32> {
        encoder.encode_text(words).unwrap()
    }

    #[test]
    fn single_user_message_is_wrapped_in_inst() {
        let enc = encoder();
        let sp = enc.special_tokens();
        let tokens = enc.encode(&[ChatMessage::user("hello world")]).unwrap();

        let mut expected = vec![sp.bos, sp.inst];
        expected.extend(ids(&enc, "hello world"));
        expected.push(sp.inst_end);
        assert_eq!(tokens, expected);
    }

    #[test]
    fn roles_are_preserved() {
        let enc = encoder();
        let sp = enc.special_tokens();
        let tokens = enc
            .encode(&[
                ChatMessage::user("hello"),
                ChatMessage::assistant("e4"),
                ChatMessage::user("e5"),
            ])
            .unwrap();

        let mut expected = vec![sp.bos, sp.inst];
        expected.extend(ids(&enc, "hello"));
        expected.push(sp.inst_end);
        expected.extend(ids(&enc, "e4"));
        expected.push(sp.eos);
        expected.push(sp.inst);
        expected.extend(ids(&enc, "e5"));
        expected.push(sp.inst_end);
        assert_eq!(tokens, expected);
    }

    #[test]
    fn system_prompt_goes_to_last_user_message() {
        let enc = encoder();
        let with_system = enc
            .encode(&[
                ChatMessage::system("you are a chess bot"),
                ChatMessage::user("hello"),
                ChatMessage::assistant("e4"),
                ChatMessage::user("e5"),
            ])
            .unwrap();
        let sp = enc.special_tokens();

        // Last [INST] block must start with the system text.
        let last_inst = with_system
            .iter()
            .rposition(|&t| t == sp.inst)
            .expect("has an [INST]");
        let system_ids = ids(&enc, "you are a chess bot");
        assert_eq!(
            &with_system[last_inst + 1..last_inst + 1 + system_ids.len()],
            system_ids.as_slice()
        );
        // The first user block is untouched.
        assert_eq!(with_system[2..2 + ids(&enc, "hello").len()], ids(&enc, "hello")[..]);
    }

    #[test]
    fn consecutive_same_role_messages_are_merged() {
        let enc = encoder();
        let merged = enc
            .encode(&[ChatMessage::user("hello"), ChatMessage::user("world")])
            .unwrap();
        let sp = enc.special_tokens();
        assert_eq!(merged.iter().filter(|&&t| t == sp.inst).count(), 1);
    }

    #[test]
    fn trailing_assistant_message_stays_open() {
        let enc = encoder();
        let tokens = enc
            .encode(&[ChatMessage::user("hello"), ChatMessage::assistant("e4")])
            .unwrap();
        assert_ne!(*tokens.last().unwrap(), enc.special_tokens().eos);
    }

    #[test]
    fn adding_messages_strictly_increases_prompt_length() {
        let enc = encoder();
        let conversation = vec![
            ChatMessage::user("hello"),
            ChatMessage::assistant("e4"),
            ChatMessage::user("e5"),
            ChatMessage::user("good move"),
            ChatMessage::system("you are a chess bot"),
            ChatMessage::assistant("Nf3"),
        ];
        let mut previous = 0;
        for n in 1..=conversation.len() {
            let len = enc.encode(&conversation[..n]).unwrap().len();
            assert!(len > previous, "{n} messages gave {len} <= {previous}");
            previous = len;
        }
    }

    #[test]
    fn empty_conversation_is_rejected() {
        let err = encoder().encode(&[]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConversation(_)));
    }

    #[test]
    fn system_only_conversation_is_rejected() {
        let err = encoder()
            .encode(&[ChatMessage::system("you are a chess bot")])
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConversation(_)));
    }

    #[test]
    fn leading_assistant_message_is_rejected() {
        let err = encoder()
            .encode(&[ChatMessage::assistant("e4"), ChatMessage::user("e5")])
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConversation(_)));
    }

    #[test]
    fn decode_skips_special_tokens() {
        let enc = encoder();
        let sp = enc.special_tokens();
        let mut tokens = ids(&enc, "good move");
        tokens.push(sp.eos);
        assert_eq!(enc.decode(&tokens).unwrap(), "good move");
    }

    #[test]
    fn tokenizer_without_control_tokens_is_rejected() {
        let tokenizer = crate::testing::tokenizer_from_vocab(&["<unk>", "hello"]);
        let err = PromptEncoder::new(Arc::new(tokenizer)).unwrap_err();
        assert!(matches!(err, EngineError::MissingSpecialToken { .. }));
    }
}
