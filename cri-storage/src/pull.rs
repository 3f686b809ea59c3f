//! State shared by the pulls of one image server.

use std::sync::{Arc, OnceLock};

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use references::{RegistryImageReference, StorageImageID};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::destination::PullProgress;

/// Options for one pull.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    /// Registry credentials.
    pub auth_file: Option<Utf8PathBuf>,
    /// Cancels the copy, the cache writes and any worker process.
    pub cancel: CancellationToken,
    /// Receives one event per completed blob.
    pub progress: Option<mpsc::UnboundedSender<PullProgress>>,
}

/// What a successful pull produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOutcome {
    /// The pulled reference, pinned to the manifest digest when known.
    pub reference: RegistryImageReference,
    /// The stored image.
    pub image_id: StorageImageID,
    /// Non-fatal problems, such as blobs that could not be cached.
    pub warnings: Vec<String>,
}

/// Names of images currently being pulled.
///
/// Keys are canonical destination references, the same strings a pull
/// writes into the image's name list, so a listing can tell whether an
/// incomplete image is one that is still arriving. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct PullRegistry {
    in_flight: Arc<DashMap<String, usize>>,
}

impl PullRegistry {
    /// Mark `name` as in flight until the guard is dropped.
    pub fn register(&self, name: impl Into<String>) -> PullGuard {
        let name = name.into();
        *self.in_flight.entry(name.clone()).or_insert(0) += 1;
        PullGuard {
            registry: self.clone(),
            name,
        }
    }

    /// True while at least one pull of `name` is running.
    pub fn is_pulling(&self, name: &str) -> bool {
        self.in_flight.contains_key(name)
    }

    /// True if any of `names` is being pulled.
    pub fn any_pulling<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> bool {
        names.into_iter().any(|name| self.is_pulling(name))
    }

    /// True when no pull is running.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    fn release(&self, name: &str) {
        if let Some(mut count) = self.in_flight.get_mut(name) {
            *count = count.saturating_sub(1);
        }
        self.in_flight.remove_if(name, |_, count| *count == 0);
    }
}

/// Keeps a name registered in a [`PullRegistry`].
#[derive(Debug)]
#[must_use = "the pull is unregistered when the guard is dropped"]
pub struct PullGuard {
    registry: PullRegistry,
    name: String,
}

impl Drop for PullGuard {
    fn drop(&mut self) {
        self.registry.release(&self.name);
    }
}

/// Whether this host can run pull workers in their own cgroup.
///
/// Probed once, on first use.
#[derive(Debug)]
pub struct CgroupProbe {
    controllers: Utf8PathBuf,
    supported: OnceLock<bool>,
}

/// Present when the unified cgroup hierarchy is mounted.
pub const CGROUP_CONTROLLERS: &str = "/sys/fs/cgroup/cgroup.controllers";

impl CgroupProbe {
    /// Probe for `controllers`.
    pub fn new(controllers: impl AsRef<Utf8Path>) -> Self {
        Self {
            controllers: controllers.as_ref().to_owned(),
            supported: OnceLock::new(),
        }
    }

    /// A probe with a fixed answer.
    pub fn fixed(supported: bool) -> Self {
        let probe = Self::new(CGROUP_CONTROLLERS);
        let _ = probe.supported.set(supported);
        probe
    }

    /// Whether cgroup v2 is available.
    pub fn supported(&self) -> bool {
        *self.supported.get_or_init(|| {
            let supported = self.controllers.exists();
            tracing::debug!(path = %self.controllers, supported, "probed for cgroup v2");
            supported
        })
    }
}

impl Default for CgroupProbe {
    fn default() -> Self {
        Self::new(CGROUP_CONTROLLERS)
    }
}
