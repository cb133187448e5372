//! Few-shot example sets.
//! Built-in defaults per target language (English fallback), loading from a
//! JSON file, and a content hash that identifies a set for cache keying.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

const DEFAULT_EXAMPLES_JSON: &str = include_str!("../../assets/default_examples.json");

/// The `human` half of a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleRequest {
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub commentary: String,
    /// Empty means "same as the batch's target language".
    #[serde(default)]
    pub target_language: String,
}

/// The `assistant` half of a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleReply {
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleTurn {
    pub human: ExampleRequest,
    pub assistant: ExampleReply,
}

/// blake3 digest of an example set's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExampleSetId([u8; 32]);

impl ExampleSetId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ExampleSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// An ordered list of example turns plus its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExampleSet {
    turns: Vec<ExampleTurn>,
    id: ExampleSetId,
}

#[derive(Debug, thiserror::Error)]
pub enum FewShotError {
    #[error("example set IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("example set parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// On-disk layout of the bundled defaults.
#[derive(Debug, Deserialize)]
struct DefaultsFile {
    #[allow(dead_code)]
    version: u32,
    fallback: String,
    languages: HashMap<String, Vec<ExampleTurn>>,
}

fn bundled() -> &'static DefaultsFile {
    static DEFAULTS: OnceLock<DefaultsFile> = OnceLock::new();
    DEFAULTS.get_or_init(|| {
        serde_json::from_str(DEFAULT_EXAMPLES_JSON).expect("bundled default examples are valid JSON")
    })
}

impl ExampleSet {
    pub fn new(turns: Vec<ExampleTurn>) -> Self {
        let id = compute_id(&turns);
        Self { turns, id }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Bundled examples for `target_language`, or the English set when the
    /// language has none.
    pub fn defaults_for(target_language: &str) -> Self {
        let defaults = bundled();
        let turns = defaults
            .languages
            .get(target_language)
            .or_else(|| defaults.languages.get(&defaults.fallback))
            .cloned()
            .unwrap_or_default();
        Self::new(turns)
    }

    /// Languages that have bundled examples.
    pub fn bundled_languages() -> Vec<&'static str> {
        let mut langs: Vec<&'static str> = bundled().languages.keys().map(String::as_str).collect();
        langs.sort_unstable();
        langs
    }

    /// Load a JSON array of `{human, assistant}` turns.
    pub fn load_from_file(path: &Path) -> Result<Self, FewShotError> {
        let content = std::fs::read_to_string(path)?;
        let turns: Vec<ExampleTurn> = serde_json::from_str(&content)?;
        Ok(Self::new(turns))
    }

    pub fn turns(&self) -> &[ExampleTurn] {
        &self.turns
    }

    pub fn id(&self) -> ExampleSetId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

fn compute_id(turns: &[ExampleTurn]) -> ExampleSetId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"fewshot/v1");
    hasher.update(&(turns.len() as u64).to_le_bytes());
    for turn in turns {
        for field in [
            &turn.human.root,
            &turn.human.commentary,
            &turn.human.target_language,
            &turn.assistant.output,
        ] {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
    }
    ExampleSetId(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn bundled_languages_have_examples() {
        assert_eq!(ExampleSet::bundled_languages(), vec!["Chinese", "English", "French"]);
        for lang in ["English", "Chinese", "French"] {
            let set = ExampleSet::defaults_for(lang);
            assert!(!set.is_empty(), "{lang}");
            assert!(set.turns().iter().all(|t| t.human.target_language == lang));
        }
    }

    #[test]
    fn unknown_language_falls_back_to_english() {
        assert_eq!(ExampleSet::defaults_for("Klingon"), ExampleSet::defaults_for("English"));
    }

    #[test]
    fn identity_tracks_content() {
        let english = ExampleSet::defaults_for("English");
        let french = ExampleSet::defaults_for("French");
        assert_eq!(english.id(), ExampleSet::defaults_for("English").id());
        assert_ne!(english.id(), french.id());

        let mut edited = english.turns().to_vec();
        edited[0].assistant.output.push('!');
        assert_ne!(ExampleSet::new(edited).id(), english.id());
        assert_ne!(ExampleSet::empty().id(), english.id());
    }

    #[test]
    fn identity_is_not_fooled_by_shifted_field_boundaries() {
        let a = ExampleSet::new(vec![ExampleTurn {
            human: ExampleRequest {
                root: "ab".into(),
                commentary: "c".into(),
                target_language: String::new(),
            },
            assistant: ExampleReply { output: "x".into() },
        }]);
        let b = ExampleSet::new(vec![ExampleTurn {
            human: ExampleRequest {
                root: "a".into(),
                commentary: "bc".into(),
                target_language: String::new(),
            },
            assistant: ExampleReply { output: "x".into() },
        }]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn loads_turns_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"human": {{"root": "R", "commentary": "C"}}, "assistant": {{"output": "O"}}}}]"#
        )
        .unwrap();

        let set = ExampleSet::load_from_file(file.path()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.turns()[0].human.target_language, "");
        assert_eq!(set.turns()[0].assistant.output, "O");
    }

    #[test]
    fn load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            ExampleSet::load_from_file(file.path()),
            Err(FewShotError::Parse(_))
        ));
    }
}
