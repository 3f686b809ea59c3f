//! One image server per storage driver, consulted default first.

use std::collections::BTreeMap;
use std::sync::Arc;

use references::{RegistryImageReference, StorageImageID};
use store::{Gathered, MultiStore, Store, StoreError};

use crate::config::ImageServerConfig;
use crate::error::{Error, Result};
use crate::image::{ImageResult, ImageServer, Resolved};
use crate::pull::{PullOptions, PullOutcome, PullRegistry};
use crate::transport::ImageTransport;

/// Image servers over every store of a [`MultiStore`].
///
/// All servers share one blob cache and one pull registry. Pulls always land
/// in the default driver's store.
#[derive(Debug)]
pub struct MultiStoreServer {
    store: MultiStore,
    default: Arc<ImageServer>,
    others: BTreeMap<String, Arc<ImageServer>>,
}

impl MultiStoreServer {
    /// Build an image server for each store in `store`.
    pub async fn new(
        store: MultiStore,
        transport: Arc<dyn ImageTransport>,
        config: ImageServerConfig,
    ) -> Result<Self> {
        let pulls = PullRegistry::default();
        let default = ImageServer::new(
            store.default_store().clone(),
            transport.clone(),
            config.clone(),
        )
        .await?
        .with_pull_registry(pulls.clone());

        let shared = ImageServerConfig {
            blob_cache_dir: None,
            ..config
        };
        let mut others = BTreeMap::new();
        for (driver, storage) in store.iter().skip(1) {
            let mut server =
                ImageServer::new(storage.clone(), transport.clone(), shared.clone())
                    .await?
                    .with_pull_registry(pulls.clone());
            if let Some(cache) = default.blob_cache() {
                server = server.with_blob_cache(cache.clone());
            }
            others.insert(driver.to_owned(), Arc::new(server));
        }

        Ok(Self {
            store,
            default: Arc::new(default),
            others,
        })
    }

    /// The stores behind the servers.
    pub fn store(&self) -> &MultiStore {
        &self.store
    }

    /// The default driver's server.
    pub fn default_image_server(&self) -> &Arc<ImageServer> {
        &self.default
    }

    /// Every server, default first.
    pub fn image_servers(&self) -> impl Iterator<Item = &Arc<ImageServer>> {
        std::iter::once(&self.default).chain(self.others.values())
    }

    /// The server for one driver.
    pub fn get_image_server(&self, driver: &str) -> Option<&Arc<ImageServer>> {
        if self.store.default_driver() == driver {
            Some(&self.default)
        } else {
            self.others.get(driver)
        }
    }

    /// The first server, default first, whose store holds the image.
    #[tracing::instrument(skip(self), fields(id = id.id_string_for_out_of_process_consumption_only()))]
    pub async fn get_image_server_for_image(
        &self,
        id: &StorageImageID,
    ) -> Result<&Arc<ImageServer>> {
        let raw = id.id_string_for_out_of_process_consumption_only();
        for server in self.image_servers() {
            match server.store().image(raw).await {
                Ok(_) => return Ok(server),
                Err(error) if error.is_not_found() => {}
                Err(error) => tracing::debug!(
                    driver = server.store().driver_name(),
                    "image lookup failed: {error}"
                ),
            }
        }
        Err(Error::ImageUnknown(raw.to_owned()))
    }

    /// Resolve `name` against each server in turn.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_names(&self, name: &str) -> Result<Resolved> {
        self.first_success(|server| server.resolve_names(name)).await
    }

    /// Describe a local image, from the first server that has it.
    #[tracing::instrument(skip(self))]
    pub async fn image_status(&self, name_or_id: &str) -> Result<ImageResult> {
        self.first_success(|server| server.image_status(name_or_id))
            .await
    }

    /// List images of every server. A failing server does not hide the
    /// images of the others.
    #[tracing::instrument(skip(self))]
    pub async fn list_all_images(&self, filter: Option<&str>) -> Gathered<ImageResult, Error> {
        let mut gathered = Gathered::default();
        for server in self.image_servers() {
            let result = server.list_images(filter).await;
            if let Err(error) = &result {
                tracing::debug!(
                    driver = server.store().driver_name(),
                    "listing images failed: {error}"
                );
            }
            gathered.push(server.store().driver_name(), result);
        }
        gathered
    }

    /// Remove an image from every server that has it.
    ///
    /// Stops at the first error caused by the input itself. When nothing was
    /// removed, a real failure is reported in preference to not-found.
    #[tracing::instrument(skip(self))]
    pub async fn remove_image(&self, name_or_id: &str, force: bool) -> Result<()> {
        let mut removed = false;
        let mut last = None;
        for server in self.image_servers() {
            match server.remove_image(name_or_id, force).await {
                Ok(()) => removed = true,
                Err(error) if error.is_input_error() => return Err(error),
                Err(error) if error.is_not_found() => {
                    if last.is_none() {
                        last = Some(error);
                    }
                }
                Err(error) => {
                    tracing::debug!(
                        driver = server.store().driver_name(),
                        "remove failed: {error}"
                    );
                    last = Some(error);
                }
            }
        }
        match (removed, last) {
            (true, _) | (false, None) => Ok(()),
            (false, Some(error)) => Err(error),
        }
    }

    /// Pull into the default driver's store.
    pub async fn pull_image(
        &self,
        reference: &RegistryImageReference,
        options: &PullOptions,
    ) -> Result<PullOutcome> {
        self.default.pull_image(reference, options).await
    }

    /// Shut down every store, returning the layers still mounted anywhere.
    pub async fn shutdown(&self, force: bool) -> Gathered<String, StoreError> {
        self.store.shutdown(force).await
    }

    /// Run `operation` on each server, default first, until one succeeds.
    ///
    /// Input errors end the search. Otherwise the last error is returned.
    async fn first_success<'a, T, F, Fut>(&'a self, mut operation: F) -> Result<T>
    where
        F: FnMut(&'a ImageServer) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + 'a,
    {
        let mut last = None;
        for server in self.image_servers() {
            match operation(server.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_input_error() => return Err(error),
                Err(error) => {
                    tracing::trace!(
                        driver = server.store().driver_name(),
                        "trying next driver: {error}"
                    );
                    last = Some(error);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::ImageUnknown(String::new())))
    }
}
