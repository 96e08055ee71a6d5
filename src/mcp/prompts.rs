//! Prompt registry.
//!
//! Prompts are listed in registration order. Each prompt is backed by a
//! [`PromptHandler`]; [`TemplatePrompt`] covers the common case of a text
//! template with `{{name}}` placeholders.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::mcp::handler::PromptHandler;
use crate::types::{Prompt, PromptMessage, PromptResult};

/// Prompt registry.
#[derive(Default)]
pub struct PromptRegistry {
    prompts: RwLock<Vec<(Prompt, Arc<dyn PromptHandler>)>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prompt, replacing one with the same name in place.
    pub fn register(&self, prompt: Prompt, handler: Arc<dyn PromptHandler>) {
        let mut prompts = self.prompts.write().unwrap_or_else(PoisonError::into_inner);
        match prompts.iter_mut().find(|(p, _)| p.name == prompt.name) {
            Some(slot) => *slot = (prompt, handler),
            None => prompts.push((prompt, handler)),
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut prompts = self.prompts.write().unwrap_or_else(PoisonError::into_inner);
        let before = prompts.len();
        prompts.retain(|(p, _)| p.name != name);
        prompts.len() != before
    }

    /// List all prompts.
    pub fn list(&self) -> Vec<Prompt> {
        self.prompts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.prompts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Render a prompt by name.
    pub async fn get(&self, name: &str, arguments: HashMap<String, String>) -> Result<PromptResult> {
        let (prompt, handler) = self
            .prompts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(p, _)| p.name == name)
            .map(|(p, h)| (p.clone(), h.clone()))
            .ok_or_else(|| Error::PromptNotFound(name.to_string()))?;

        for arg in prompt.arguments.iter().filter(|a| a.required) {
            if !arguments.contains_key(&arg.name) {
                return Err(Error::InvalidParams(format!(
                    "Missing required argument: {}",
                    arg.name
                )));
            }
        }

        let mut result = handler.get(arguments).await?;
        if result.description.is_none() {
            result.description = prompt.description;
        }
        Ok(result)
    }
}

/// Flatten wire arguments to strings; non-string values become JSON text.
pub fn flatten_arguments(arguments: Option<&Map<String, Value>>) -> HashMap<String, String> {
    arguments
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let text = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), text)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Template for generating prompt messages.
#[derive(Debug, Clone)]
pub struct TemplatePrompt {
    pub template: String,
}

impl TemplatePrompt {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Substitute `{{name}}` placeholders; unknown placeholders become empty.
    pub fn render(&self, arguments: &HashMap<String, String>) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let key = after[..end].trim();
                    if let Some(value) = arguments.get(key) {
                        out.push_str(value);
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[async_trait]
impl PromptHandler for TemplatePrompt {
    async fn get(&self, arguments: HashMap<String, String>) -> Result<PromptResult> {
        Ok(PromptResult {
            description: None,
            messages: vec![PromptMessage::user(self.render(&arguments))],
        })
    }
}
