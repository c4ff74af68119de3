use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;

use crate::db::Metadata;

/// A piece of content that can be scored and reviewed.
pub trait Moderatable: Send + Sync {
    fn content_type(&self) -> &str;
    fn content_id(&self) -> i64;
    fn owner_id(&self) -> Option<i32>;
    /// Text handed to the scorer.
    fn moderation_content(&self) -> String;
    fn moderation_context(&self) -> Metadata {
        Metadata::new()
    }
}

/// Loads and publishes one kind of content.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn load(&self, content_id: i64) -> Result<Option<Box<dyn Moderatable>>>;
    async fn publish(&self, content_id: i64) -> Result<()>;
}

/// Resolves `(content_type, content_id)` pairs to their sources.
#[derive(Clone, Default)]
pub struct ContentRegistry {
    sources: Arc<DashMap<String, Arc<dyn ContentSource>>>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, content_type: impl Into<String>, source: Arc<dyn ContentSource>) {
        self.sources.insert(content_type.into(), source);
    }

    pub fn source(&self, content_type: &str) -> Option<Arc<dyn ContentSource>> {
        self.sources
            .get(content_type)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub async fn load(&self, content_type: &str, content_id: i64) -> Result<Option<Box<dyn Moderatable>>> {
        match self.source(content_type) {
            Some(source) => source.load(content_id).await,
            None => Ok(None),
        }
    }

    pub async fn publish(&self, content_type: &str, content_id: i64) -> Result<()> {
        let source = self
            .source(content_type)
            .ok_or_else(|| anyhow!("no content source registered for `{content_type}`"))?;
        source.publish(content_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Article {
        id: i64,
    }

    impl Moderatable for Article {
        fn content_type(&self) -> &str {
            "article"
        }

        fn content_id(&self) -> i64 {
            self.id
        }

        fn owner_id(&self) -> Option<i32> {
            Some(3)
        }

        fn moderation_content(&self) -> String {
            "breathing exercises for exam stress".into()
        }
    }

    #[derive(Default)]
    struct Articles {
        published: AtomicUsize,
    }

    #[async_trait]
    impl ContentSource for Articles {
        async fn load(&self, content_id: i64) -> Result<Option<Box<dyn Moderatable>>> {
            Ok(Some(Box::new(Article { id: content_id })))
        }

        async fn publish(&self, _content_id: i64) -> Result<()> {
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn resolves_registered_types_only() {
        let registry = ContentRegistry::new();
        let articles = Arc::new(Articles::default());
        registry.register("article", articles.clone());

        let loaded = registry.load("article", 42).await.unwrap().unwrap();
        assert_eq!(loaded.content_id(), 42);
        assert_eq!(loaded.owner_id(), Some(3));
        assert!(registry.load("video", 42).await.unwrap().is_none());

        registry.publish("article", 42).await.unwrap();
        assert_eq!(articles.published.load(Ordering::SeqCst), 1);
        assert!(registry.publish("video", 1).await.is_err());
    }
}
