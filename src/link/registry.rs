//! Link Registry
//!
//! Owns every configured link by name. Built once at startup and passed
//! explicitly to the admin surface.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Link, LinkStatus, WorkerSelection};
use crate::config::{ExecutorConfig, WolfRelayConfig};
use crate::error::{Error, Result};
use crate::executor::{Executor, MariaDbExecutor, RecordingExecutor};

#[derive(Default)]
pub struct LinkRegistry {
    links: HashMap<String, Arc<Link>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every link in `config`, connecting their executors
    pub async fn open(config: &WolfRelayConfig) -> Result<Self> {
        let mut registry = Self::new();
        for link_config in &config.links {
            let executor: Arc<dyn Executor> = match &link_config.executor {
                ExecutorConfig::Recording => Arc::new(RecordingExecutor::new()),
                ExecutorConfig::Mariadb(db) => Arc::new(MariaDbExecutor::new(db).await?),
            };
            let link = Link::open(config, link_config, executor).await?;
            tracing::info!(
                "Opened link '{}' to {}:{} ({} executor)",
                link_config.name,
                link_config.host,
                link_config.port,
                link.executor.name()
            );
            registry.insert(link)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, link: Link) -> Result<Arc<Link>> {
        let name = link.name().to_string();
        if self.links.contains_key(&name) {
            return Err(Error::Config(format!("duplicate link name '{}'", name)));
        }
        let link = Arc::new(link);
        self.links.insert(name, Arc::clone(&link));
        Ok(link)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Link>> {
        self.links
            .get(name)
            .cloned()
            .ok_or_else(|| Error::LinkNotFound(name.to_string()))
    }

    /// Link names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.links.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Start the links configured with `auto_start`
    pub async fn start_configured(&self) {
        for name in self.names() {
            let Some(link) = self.links.get(&name) else {
                continue;
            };
            if !link.auto_start() {
                tracing::info!("Link '{}' left stopped (auto_start = false)", name);
                continue;
            }
            if let Err(e) = link.start(WorkerSelection::Both, None).await {
                tracing::error!("Failed to start link '{}': {}", name, e);
            }
        }
    }

    pub async fn statuses(&self) -> Vec<LinkStatus> {
        let mut out = Vec::with_capacity(self.links.len());
        for name in self.names() {
            if let Some(link) = self.links.get(&name) {
                out.push(link.status().await);
            }
        }
        out
    }

    /// Stop every worker of every link and close the relay logs
    pub async fn shutdown(&self) {
        for (name, link) in &self.links {
            tracing::debug!("Stopping link '{}'", name);
            link.shutdown().await;
        }
    }
}
