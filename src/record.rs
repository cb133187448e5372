//! Input and output record types.

use serde::{Deserialize, Serialize};

/// One root/commentary pair. Identified by its position in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub root: String,
    pub commentary: String,
}

impl Record {
    pub fn new(root: impl Into<String>, commentary: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            commentary: commentary.into(),
        }
    }

    pub fn has_commentary(&self) -> bool {
        !self.commentary.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatedRecord {
    pub root: String,
    pub commentary: String,
    pub commentary_translation: String,
}

impl TranslatedRecord {
    pub fn from_record(record: Record, commentary_translation: String) -> Self {
        Self {
            root: record.root,
            commentary: record.commentary,
            commentary_translation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_field_names() {
        let record: Record = serde_json::from_str(r#"{"root": "R", "commentary": "C"}"#).unwrap();
        assert_eq!(record, Record::new("R", "C"));

        let out = TranslatedRecord::from_record(record, "T".into());
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"root": "R", "commentary": "C", "commentary_translation": "T"})
        );
    }
}
