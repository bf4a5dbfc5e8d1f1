use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::request::Approach;

/// One entry of the citation lookup table sent by the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationLookupEntry {
    /// Chunk path the citation was produced from.
    #[serde(default)]
    pub citation: String,
    /// Storage path of the source document.
    #[serde(default)]
    pub source_path: String,
    /// Page number inside the source document (may be empty).
    #[serde(default, deserialize_with = "string_or_number")]
    pub page_number: String,
}

/// Citation key (for example `File0`) to lookup entry.
pub type CitationLookup = BTreeMap<String, CitationLookupEntry>;

/// Non-streaming chat/ask response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub thoughts: Option<String>,
    #[serde(default)]
    pub data_points: Vec<String>,
    #[serde(default)]
    pub citation_lookup: CitationLookup,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub thought_chain: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approach: Option<Approach>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatResponse {
    /// Returns the backend error message, if any non-blank one is present.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.trim().is_empty())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_entry_accepts_numeric_page_numbers() {
        let entry: CitationLookupEntry = serde_json::from_value(serde_json::json!({
            "citation": "https://acct/content/a.pdf/a-0.json",
            "source_path": "https://acct/upload/a.pdf",
            "page_number": 3
        }))
        .expect("entry");
        assert_eq!(entry.page_number, "3");

        let missing: CitationLookupEntry =
            serde_json::from_value(serde_json::json!({"source_path": "x"})).expect("entry");
        assert_eq!(missing.page_number, "");
    }

    #[test]
    fn response_tolerates_missing_optional_fields() {
        let resp: ChatResponse =
            serde_json::from_value(serde_json::json!({"answer": "hi", "thoughts": null}))
                .expect("response");
        assert_eq!(resp.answer, "hi");
        assert!(resp.citation_lookup.is_empty());
        assert!(resp.error_message().is_none());

        let failed: ChatResponse =
            serde_json::from_value(serde_json::json!({"error": "quota"})).expect("response");
        assert_eq!(failed.error_message(), Some("quota"));
    }
}
