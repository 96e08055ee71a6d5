//! Level-1 URI templates (`file:///{path}`, `db://{table}/rows/{id}`).
//!
//! Matching is greedy-free: a placeholder takes a non-empty run of characters
//! that ends at the first occurrence of the literal following it. A trailing
//! placeholder takes the non-empty remainder of the URI.

use std::collections::HashMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A parsed URI template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl UriTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = template;

        while !rest.is_empty() {
            match rest.find('{') {
                Some(0) => {
                    let close = rest.find('}').ok_or_else(|| {
                        Error::InvalidParams(format!("unclosed placeholder in {}", template))
                    })?;
                    let name = &rest[1..close];
                    if name.is_empty() || name.contains('{') {
                        return Err(Error::InvalidParams(format!(
                            "malformed placeholder in {}",
                            template
                        )));
                    }
                    if matches!(segments.last(), Some(Segment::Variable(_))) {
                        return Err(Error::InvalidParams(format!(
                            "adjacent placeholders in {}",
                            template
                        )));
                    }
                    segments.push(Segment::Variable(name.to_string()));
                    rest = &rest[close + 1..];
                }
                Some(open) => {
                    segments.push(Segment::Literal(rest[..open].to_string()));
                    rest = &rest[open..];
                }
                None => {
                    if rest.contains('}') {
                        return Err(Error::InvalidParams(format!(
                            "stray '}}' in {}",
                            template
                        )));
                    }
                    segments.push(Segment::Literal(rest.to_string()));
                    rest = "";
                }
            }
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Placeholder names in order of appearance.
    pub fn variables(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Variable(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Match `uri`, returning the captured variables.
    pub fn matches(&self, uri: &str) -> Option<HashMap<String, String>> {
        let mut captured = HashMap::new();
        let mut rest = uri;
        let mut segments = self.segments.iter().peekable();

        while let Some(segment) = segments.next() {
            match segment {
                Segment::Literal(literal) => {
                    rest = rest.strip_prefix(literal.as_str())?;
                }
                Segment::Variable(name) => {
                    let end = match segments.peek() {
                        Some(Segment::Literal(next)) => rest.find(next.as_str())?,
                        _ => rest.len(),
                    };
                    if end == 0 {
                        return None;
                    }
                    captured.insert(name.clone(), rest[..end].to_string());
                    rest = &rest[end..];
                }
            }
        }

        if rest.is_empty() {
            Some(captured)
        } else {
            None
        }
    }

    /// Substitute variables back into the template.
    pub fn expand(&self, variables: &HashMap<String, String>) -> String {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(literal) => literal.as_str(),
                Segment::Variable(name) => variables.get(name).map(String::as_str).unwrap_or(""),
            })
            .collect()
    }
}

impl std::fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}
