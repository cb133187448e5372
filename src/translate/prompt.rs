//! Prompt assembly: few-shot turns become alternating user/assistant
//! messages, followed by the record being translated.

use serde::Serialize;

use super::fewshot::ExampleTurn;

/// Kept short; the few-shot turns carry the style.
pub const SYSTEM_PROMPT: &str =
    "You translate commentaries on classical texts. Output only the translated commentary, nothing else.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptTurn {
    pub role: Role,
    pub text: String,
}

/// Everything a backend needs to translate one commentary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub system: String,
    pub turns: Vec<PromptTurn>,
    #[serde(skip)]
    commentary: String,
    #[serde(skip)]
    target_language: String,
}

impl Prompt {
    /// Build the conversation for one record.
    pub fn for_record(
        examples: &[ExampleTurn],
        root: &str,
        commentary: &str,
        target_language: &str,
    ) -> Self {
        let mut turns = Vec::with_capacity(examples.len() * 2 + 1);
        for example in examples {
            let lang = if example.human.target_language.is_empty() {
                target_language
            } else {
                example.human.target_language.as_str()
            };
            turns.push(PromptTurn {
                role: Role::User,
                text: user_message(&example.human.root, &example.human.commentary, lang),
            });
            turns.push(PromptTurn {
                role: Role::Assistant,
                text: example.assistant.output.clone(),
            });
        }
        turns.push(PromptTurn {
            role: Role::User,
            text: user_message(root, commentary, target_language),
        });

        Self {
            system: SYSTEM_PROMPT.to_string(),
            turns,
            commentary: commentary.to_string(),
            target_language: target_language.to_string(),
        }
    }

    /// The commentary this prompt asks to translate.
    pub fn commentary(&self) -> &str {
        &self.commentary
    }

    pub fn target_language(&self) -> &str {
        &self.target_language
    }
}

fn user_message(root: &str, commentary: &str, target_language: &str) -> String {
    format!(
        "Root text: {root}\n\nCommentary: {commentary}\n\n\
         Please translate the commentary to {target_language}. Leave the root text untranslated."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::fewshot::{ExampleReply, ExampleRequest};

    fn turn(root: &str, commentary: &str, lang: &str, output: &str) -> ExampleTurn {
        ExampleTurn {
            human: ExampleRequest {
                root: root.into(),
                commentary: commentary.into(),
                target_language: lang.into(),
            },
            assistant: ExampleReply {
                output: output.into(),
            },
        }
    }

    #[test]
    fn examples_become_alternating_turns_before_the_record() {
        let examples = vec![turn("ER1", "EC1", "French", "EO1"), turn("ER2", "EC2", "", "EO2")];
        let prompt = Prompt::for_record(&examples, "R", "C", "German");

        let roles: Vec<Role> = prompt.turns.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User]
        );
        assert!(prompt.turns[0].text.contains("translate the commentary to French"));
        // example without a language inherits the requested one
        assert!(prompt.turns[2].text.contains("translate the commentary to German"));
        assert_eq!(prompt.turns[3].text, "EO2");

        let last = &prompt.turns[4].text;
        assert!(last.starts_with("Root text: R\n\nCommentary: C\n\n"));
        assert!(last.ends_with("Leave the root text untranslated."));
        assert_eq!(prompt.commentary(), "C");
        assert_eq!(prompt.target_language(), "German");
    }

    #[test]
    fn no_examples_yields_single_user_turn() {
        let prompt = Prompt::for_record(&[], "", "C", "English");
        assert_eq!(prompt.turns.len(), 1);
        assert_eq!(prompt.system, SYSTEM_PROMPT);
    }
}
