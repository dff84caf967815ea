//! Input/output parameter documents (`io_params.json`) and payload validation.

use crate::error::{ModeldError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A declared feature. Fields beyond `name`/`type` (e.g. `encoder`) are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_hint: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Model schema parsed from an `io_params.json` document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub input_features: Vec<Feature>,
    #[serde(default)]
    pub output_features: Vec<Feature>,
}

impl Schema {
    /// Parse an `io_params` document
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let schema: Self = serde_json::from_slice(bytes)
            .map_err(|e| ModeldError::MissingInput(format!("io_params is not a valid schema: {e}")))?;

        if let Some(feature) = schema.input_features.iter().find(|f| f.name.is_empty()) {
            return Err(ModeldError::MissingInput(format!(
                "io_params input feature without a name (type '{}')",
                feature.type_hint
            )));
        }

        Ok(schema)
    }

    /// Names of the required input features, in declaration order
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.input_features.iter().map(|f| f.name.as_str())
    }

    /// Check that `payload` supplies every declared input feature.
    ///
    /// A field counts as present when the payload has an entry for it whose value
    /// is not `null`; empty strings, zero, `false` and empty lists are valid values.
    /// Fields the schema does not declare are ignored.
    pub fn validate(&self, payload: &Value) -> Result<()> {
        let object = payload.as_object().ok_or_else(|| {
            ModeldError::MissingInput("eval payload must be a JSON object".to_string())
        })?;

        let missing: Vec<String> = self
            .input_names()
            .filter(|name| object.get(*name).map_or(true, Value::is_null))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ModeldError::SchemaValidationFailed { missing })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::from_slice(
            br#"{
                "input_features": [
                    {"name": "doc_text", "type": "text", "encoder": "parallel_cnn"},
                    {"name": "count", "type": "number"},
                    {"name": "flag", "type": "binary"}
                ],
                "output_features": [{"name": "class", "type": "category"}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_keeps_order_and_extras() {
        let schema = schema();
        let names: Vec<&str> = schema.input_names().collect();
        assert_eq!(names, vec!["doc_text", "count", "flag"]);
        assert_eq!(schema.input_features[0].type_hint, "text");
        assert_eq!(
            schema.input_features[0].extra.get("encoder"),
            Some(&json!("parallel_cnn"))
        );
        assert_eq!(schema.output_features.len(), 1);
    }

    #[test]
    fn test_parse_rejects_missing_input_features() {
        let err = Schema::from_slice(br#"{"output_features": []}"#).unwrap_err();
        assert!(matches!(err, ModeldError::MissingInput(_)));
        assert!(Schema::from_slice(b"not json").is_err());
        assert!(Schema::from_slice(br#"{"input_features": [{"name": ""}]}"#).is_err());
    }

    #[test]
    fn test_falsy_values_are_present() {
        let payload = json!({"doc_text": "", "count": 0, "flag": false});
        assert!(schema().validate(&payload).is_ok());

        let payload = json!({"doc_text": [], "count": 0.0, "flag": {}});
        assert!(schema().validate(&payload).is_ok());
    }

    #[test]
    fn test_missing_fields_are_named_in_order() {
        let payload = json!({"count": 3});
        match schema().validate(&payload) {
            Err(ModeldError::SchemaValidationFailed { missing }) => {
                assert_eq!(missing, vec!["doc_text".to_string(), "flag".to_string()]);
            }
            other => panic!("Expected SchemaValidationFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_null_counts_as_missing() {
        let payload = json!({"doc_text": null, "count": 1, "flag": true});
        match schema().validate(&payload) {
            Err(ModeldError::SchemaValidationFailed { missing }) => {
                assert_eq!(missing, vec!["doc_text".to_string()]);
            }
            other => panic!("Expected SchemaValidationFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_extra_fields_ignored() {
        let payload = json!({"doc_text": "football", "count": 1, "flag": true, "noise": 42});
        assert!(schema().validate(&payload).is_ok());
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let err = schema().validate(&json!(["doc_text"])).unwrap_err();
        assert!(matches!(err, ModeldError::MissingInput(_)));
    }
}
