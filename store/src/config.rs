use camino::Utf8PathBuf;
use serde::Deserialize;
use store_driver::StoreError;

use crate::{LocalStore, MemoryStore, MultiStore, Storage};

/// One storage backend. The set of backends is closed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum StoreConfig {
    /// Records kept in memory.
    Memory {
        /// Storage driver name this store answers to.
        driver: String,
    },

    /// Records persisted under a graph root.
    #[serde(rename_all = "kebab-case")]
    Local {
        /// Storage driver name this store answers to.
        driver: String,
        /// Root for persistent data.
        graph_root: Utf8PathBuf,
        /// Root for runtime data.
        run_root: Utf8PathBuf,
    },
}

impl StoreConfig {
    /// The storage driver name.
    pub fn driver(&self) -> &str {
        match self {
            StoreConfig::Memory { driver } => driver,
            StoreConfig::Local { driver, .. } => driver,
        }
    }

    /// Construct the backend.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StoreError> {
        let storage: Storage = match self {
            StoreConfig::Memory { driver } => MemoryStore::new(driver).into(),
            StoreConfig::Local {
                driver,
                graph_root,
                run_root,
            } => LocalStore::open(driver, graph_root, run_root).await?.into(),
        };
        Ok(storage)
    }
}

/// Every configured backend plus the one to prefer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MultiStoreConfig {
    /// Driver consulted first, and the target of new pulls.
    #[serde(default = "default_driver")]
    pub default_driver: String,

    /// Backends, one per driver name.
    #[serde(default = "default_stores")]
    pub stores: Vec<StoreConfig>,
}

fn default_driver() -> String {
    "overlay".into()
}

fn default_stores() -> Vec<StoreConfig> {
    vec![StoreConfig::Local {
        driver: default_driver(),
        graph_root: "/var/lib/containers/storage".into(),
        run_root: "/run/containers/storage".into(),
    }]
}

impl Default for MultiStoreConfig {
    fn default() -> Self {
        Self {
            default_driver: default_driver(),
            stores: default_stores(),
        }
    }
}

impl MultiStoreConfig {
    /// Construct every backend and compose them.
    #[tracing::instrument]
    pub async fn build(self) -> Result<MultiStore, StoreError> {
        let mut stores = Vec::with_capacity(self.stores.len());
        for config in self.stores {
            stores.push(config.build().await?);
        }
        MultiStore::new(&self.default_driver, stores)
    }
}
