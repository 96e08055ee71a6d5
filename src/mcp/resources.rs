//! MCP Resources Support
//!
//! Static resources are matched by exact URI, then templates are tried in
//! registration order. The registry also tracks which URIs the client
//! subscribed to.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::mcp::handler::ResourceHandler;
use crate::mcp::uri_template::UriTemplate;
use crate::transport::lock;
use crate::types::{Resource, ResourceContents, ResourceTemplate};

struct TemplateEntry {
    template: ResourceTemplate,
    parsed: UriTemplate,
    handler: Arc<dyn ResourceHandler>,
}

/// Resource registry and subscription set.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: RwLock<Vec<(Resource, Arc<dyn ResourceHandler>)>>,
    templates: RwLock<Vec<TemplateEntry>>,
    subscriptions: Mutex<HashSet<String>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resource(&self, resource: Resource, handler: Arc<dyn ResourceHandler>) {
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        match resources.iter_mut().find(|(r, _)| r.uri == resource.uri) {
            Some(slot) => *slot = (resource, handler),
            None => resources.push((resource, handler)),
        }
    }

    pub fn add_template(
        &self,
        template: ResourceTemplate,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<()> {
        let parsed = UriTemplate::parse(&template.uri_template)?;
        let mut templates = self.templates.write().unwrap_or_else(PoisonError::into_inner);
        templates.retain(|t| t.template.uri_template != template.uri_template);
        templates.push(TemplateEntry {
            template,
            parsed,
            handler,
        });
        Ok(())
    }

    pub fn remove_resource(&self, uri: &str) -> bool {
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        let before = resources.len();
        resources.retain(|(r, _)| r.uri != uri);
        resources.len() != before
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub fn list_templates(&self) -> Vec<ResourceTemplate> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|t| t.template.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.list_resources().is_empty() && self.list_templates().is_empty()
    }

    /// Find the handler for `uri` and the variables its template captured.
    pub fn resolve(
        &self,
        uri: &str,
    ) -> Option<(Arc<dyn ResourceHandler>, HashMap<String, String>)> {
        let exact = self
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(r, _)| r.uri == uri)
            .map(|(_, h)| h.clone());
        if let Some(handler) = exact {
            return Some((handler, HashMap::new()));
        }

        let templates = self.templates.read().unwrap_or_else(PoisonError::into_inner);
        templates.iter().find_map(|t| {
            t.parsed.matches(uri).map(|vars| {
                debug!("{} matched template {}", uri, t.parsed);
                (t.handler.clone(), vars)
            })
        })
    }

    /// Read `uri` through its handler.
    ///
    /// # Examples
    ///
    /// ```
    /// # tokio_test::block_on(async {
    /// use std::collections::HashMap;
    /// use mcp_engine_rs::mcp::handler::resource_fn;
    /// use mcp_engine_rs::mcp::resources::ResourceRegistry;
    /// use mcp_engine_rs::types::{ResourceContents, ResourceTemplate};
    ///
    /// let registry = ResourceRegistry::new();
    /// registry
    ///     .add_template(
    ///         ResourceTemplate::new("file:///{path}", "files"),
    ///         resource_fn(|uri: String, vars: HashMap<String, String>| async move {
    ///             Ok(vec![ResourceContents::text(uri, vars["path"].clone())])
    ///         }),
    ///     )
    ///     .unwrap();
    ///
    /// let contents = registry.read("file:///notes.txt").await.unwrap();
    /// assert_eq!(contents[0].text.as_deref(), Some("notes.txt"));
    /// assert!(registry.read("http://elsewhere").await.is_err());
    /// # });
    /// ```
    pub async fn read(&self, uri: &str) -> Result<Vec<ResourceContents>> {
        let (handler, variables) = self
            .resolve(uri)
            .ok_or_else(|| Error::ResourceNotFound(uri.to_string()))?;
        let contents = handler.read(uri, &variables).await?;
        if contents.is_empty() {
            return Err(Error::ResourceNotFound(uri.to_string()));
        }
        Ok(contents)
    }

    pub async fn subscribe(&self, uri: &str) -> Result<()> {
        if let Some((handler, _)) = self.resolve(uri) {
            handler.subscribe(uri).await?;
        }
        lock(&self.subscriptions).insert(uri.to_string());
        Ok(())
    }

    pub async fn unsubscribe(&self, uri: &str) -> Result<()> {
        let removed = lock(&self.subscriptions).remove(uri);
        if removed {
            if let Some((handler, _)) = self.resolve(uri) {
                handler.unsubscribe(uri).await?;
            }
        }
        Ok(())
    }

    pub fn is_subscribed(&self, uri: &str) -> bool {
        lock(&self.subscriptions).contains(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::handler::resource_fn;

    fn registry() -> ResourceRegistry {
        let registry = ResourceRegistry::new();
        registry.add_resource(
            Resource::new("static://readme", "readme"),
            resource_fn(|uri: String, _vars: HashMap<String, String>| async move {
                Ok(vec![ResourceContents::text(uri, "read me")])
            }),
        );
        registry
            .add_template(
                ResourceTemplate::new("file:///{path}", "files"),
                resource_fn(|uri: String, vars: HashMap<String, String>| async move {
                    Ok(vec![ResourceContents::text(uri, format!("path={}", vars["path"]))])
                }),
            )
            .unwrap();
        registry
            .add_template(
                ResourceTemplate::new("empty://{x}", "empty"),
                resource_fn(|_uri: String, _vars: HashMap<String, String>| async move {
                    Ok(Vec::new())
                }),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_exact_resource_wins() {
        let contents = registry().read("static://readme").await.unwrap();
        assert_eq!(contents[0].text.as_deref(), Some("read me"));
    }

    #[tokio::test]
    async fn test_template_routing() {
        let contents = registry().read("file:///a/b.txt").await.unwrap();
        assert_eq!(contents[0].uri, "file:///a/b.txt");
        assert_eq!(contents[0].text.as_deref(), Some("path=a/b.txt"));
    }

    #[tokio::test]
    async fn test_unmatched_or_empty_is_not_found() {
        let registry = registry();
        assert!(matches!(
            registry.read("http://nowhere").await,
            Err(Error::ResourceNotFound(_))
        ));
        assert!(matches!(
            registry.read("empty://thing").await,
            Err(Error::ResourceNotFound(_))
        ));
    }

    #[test]
    fn test_bad_template_rejected() {
        let registry = ResourceRegistry::new();
        let result = registry.add_template(
            ResourceTemplate::new("file:///{path", "broken"),
            resource_fn(|_uri: String, _vars: HashMap<String, String>| async move {
                Ok(Vec::new())
            }),
        );
        assert!(result.is_err());
        assert!(registry.list_templates().is_empty());
    }

    #[tokio::test]
    async fn test_subscriptions() {
        let registry = registry();
        registry.subscribe("file:///watched.txt").await.unwrap();
        assert!(registry.is_subscribed("file:///watched.txt"));
        assert!(!registry.is_subscribed("file:///other.txt"));

        registry.unsubscribe("file:///watched.txt").await.unwrap();
        assert!(!registry.is_subscribed("file:///watched.txt"));
    }
}
