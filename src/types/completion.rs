//! Argument autocompletion.

use serde::{Deserialize, Serialize};

/// What is being completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CompletionReference {
    #[serde(rename = "ref/prompt")]
    Prompt { name: String },
    #[serde(rename = "ref/resource")]
    Resource { uri: String },
}

/// The argument being completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionArgument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub value: String,
}

/// Params of completion/complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteParams {
    #[serde(rename = "ref")]
    pub reference: CompletionReference,
    pub argument: CompletionArgument,
}

/// Completion values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
    #[serde(default)]
    pub has_more: bool,
}

impl CompletionResult {
    pub fn new(values: Vec<String>) -> Self {
        Self {
            values,
            total: None,
            has_more: false,
        }
    }
}

/// Wire wrapper of completion/complete results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteResult {
    pub completion: CompletionResult,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reference_tags() {
        let prompt: CompletionReference =
            serde_json::from_value(json!({"type": "ref/prompt", "name": "greeting"})).unwrap();
        assert_eq!(
            prompt,
            CompletionReference::Prompt {
                name: "greeting".to_string()
            }
        );

        let resource: CompletionReference =
            serde_json::from_value(json!({"type": "ref/resource", "uri": "file:///{path}"}))
                .unwrap();
        assert!(matches!(resource, CompletionReference::Resource { .. }));
    }

    #[test]
    fn test_params_without_argument_name() {
        let params: CompleteParams = serde_json::from_value(json!({
            "ref": {"type": "ref/prompt", "name": "greeting"},
            "argument": {"value": "Al"}
        }))
        .unwrap();
        assert!(params.argument.name.is_none());
        assert_eq!(params.argument.value, "Al");
    }

    #[test]
    fn test_result_shape() {
        let result = CompleteResult {
            completion: CompletionResult::new(vec!["Alice".to_string()]),
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({"completion": {"values": ["Alice"], "hasMore": false}})
        );
    }
}
