//! Named cluster registry

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::ContextError;
use crate::client::ClusterClient;

/// Clients by cluster name, plus the default one
#[derive(Clone)]
pub struct Clusters {
    default: Arc<dyn ClusterClient>,
    named: Arc<BTreeMap<String, Arc<dyn ClusterClient>>>,
}

impl fmt::Debug for Clusters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clusters")
            .field("named", &self.named.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Clusters {
    pub fn new(default: Arc<dyn ClusterClient>) -> Self {
        Self {
            default,
            named: Arc::new(BTreeMap::new()),
        }
    }

    /// Register an additional cluster under `name`
    pub fn register(mut self, name: impl Into<String>, client: Arc<dyn ClusterClient>) -> Self {
        Arc::make_mut(&mut self.named).insert(name.into(), client);
        self
    }

    /// Client for `name`, or the default client when `None`
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn ClusterClient>, ContextError> {
        match name {
            None => Ok(self.default.clone()),
            Some(name) => self
                .named
                .get(name)
                .cloned()
                .ok_or_else(|| ContextError::UnknownCluster(name.to_string())),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }
}
