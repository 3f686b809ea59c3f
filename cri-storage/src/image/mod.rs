//! Resolving, pulling and describing images in one store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use blobcache::{BlobCache, GcStats};
use oci_spec::image::{ImageConfiguration, ImageManifest};
use parking_lot::RwLock;
use references::{Digest, ImageName, ReferenceError, RegistryImageReference, StorageImageID};
use store::{ImageRecord, Storage, Store, IMAGE_DIGEST_BIG_DATA_KEY};
use tokio_util::sync::CancellationToken;

use crate::config::ImageServerConfig;
use crate::destination::StoreDestination;
use crate::error::{Error, Result};
use crate::isolated::{pull_isolated, CgroupMover, PullJob};
use crate::pull::{CgroupProbe, PullOptions, PullOutcome, PullRegistry};
use crate::tee::CachingDestination;
use crate::transport::{with_default_transport, ImageDestination, ImageTransport};

mod names;

use names::{make_repo_digests, matches_pinned, sort_names_by_type};

/// Inputs shorter than this are never treated as ID prefixes.
const MINIMUM_TRUNCATED_ID_LENGTH: usize = 3;

/// What a user-supplied image string refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// A local image, found by ID or ID prefix.
    ImageId(StorageImageID),
    /// Registry references to try, in order.
    Candidates(Vec<RegistryImageReference>),
}

/// Everything derived from an image's stored manifest and configuration.
#[derive(Debug)]
pub(crate) struct ImageCacheItem {
    config: Arc<ImageConfiguration>,
    config_digest: Digest,
    size: Option<u64>,
}

/// A snapshot of one image for listing and status queries.
#[derive(Debug, Clone)]
pub struct ImageResult {
    /// The image.
    pub id: StorageImageID,
    /// A name to show when only one fits.
    pub some_name_of_this_image: Option<RegistryImageReference>,
    /// Tagged names, sorted.
    pub repo_tags: Vec<String>,
    /// Digested names, stored and derived, sorted.
    pub repo_digests: Vec<String>,
    /// Total size, when the store could compute it.
    pub size: Option<u64>,
    /// The manifest digest.
    pub digest: Option<Digest>,
    /// The configuration blob's digest.
    pub config_digest: Digest,
    /// The user processes run as, possibly empty.
    pub user: String,
    /// Image labels.
    pub labels: HashMap<String, String>,
    /// Names the image used to carry.
    pub previous_names: Vec<String>,
    /// The parsed image configuration.
    pub oci_config: Arc<ImageConfiguration>,
    /// Whether a pin pattern matches one of the image's names.
    pub pinned: bool,
}

type ImageCache = HashMap<StorageImageID, Arc<ImageCacheItem>>;

/// The authority for images in one store.
///
/// Keeps a cache of parsed image metadata keyed by image ID. An unfiltered
/// [`ImageServer::list_images`] replaces the whole cache, so entries for
/// deleted images never outlive the next listing. Readers holding the old
/// map keep a consistent snapshot.
#[derive(Debug)]
pub struct ImageServer {
    store: Storage,
    transport: Arc<dyn ImageTransport>,
    config: ImageServerConfig,
    pinned: RwLock<Vec<String>>,
    blob_cache: Option<Arc<BlobCache>>,
    cache: ArcSwap<ImageCache>,
    pulls: PullRegistry,
    cgroup: CgroupProbe,
    mover: Option<Arc<dyn CgroupMover>>,
}

impl ImageServer {
    /// Serve images in `store`, pulling through `transport`.
    ///
    /// Opens the blob cache if one is configured.
    pub async fn new(
        store: Storage,
        transport: Arc<dyn ImageTransport>,
        config: ImageServerConfig,
    ) -> Result<Self> {
        let blob_cache = match &config.blob_cache_dir {
            Some(dir) => Some(Arc::new(BlobCache::new(dir).await?)),
            None => None,
        };

        Ok(Self {
            pinned: RwLock::new(config.pinned_images.clone()),
            store,
            transport,
            config,
            blob_cache,
            cache: ArcSwap::from_pointee(HashMap::new()),
            pulls: PullRegistry::default(),
            cgroup: CgroupProbe::default(),
            mover: None,
        })
    }

    /// Feed pulled layers into `cache`.
    pub fn with_blob_cache(mut self, cache: Arc<BlobCache>) -> Self {
        self.blob_cache = Some(cache);
        self
    }

    /// Track pulls in a registry shared with other servers.
    pub fn with_pull_registry(mut self, pulls: PullRegistry) -> Self {
        self.pulls = pulls;
        self
    }

    /// Replace the cgroup v2 probe.
    pub fn with_cgroup_probe(mut self, probe: CgroupProbe) -> Self {
        self.cgroup = probe;
        self
    }

    /// Move isolated pull workers into their own scope with `mover`.
    pub fn with_cgroup_mover(mut self, mover: Arc<dyn CgroupMover>) -> Self {
        self.mover = Some(mover);
        self
    }

    /// The backing store.
    pub fn store(&self) -> &Storage {
        &self.store
    }

    /// The configuration this server was built with.
    pub fn config(&self) -> &ImageServerConfig {
        &self.config
    }

    /// Pulls currently running.
    pub fn pull_registry(&self) -> &PullRegistry {
        &self.pulls
    }

    /// The blob cache pulls feed, if any.
    pub fn blob_cache(&self) -> Option<&Arc<BlobCache>> {
        self.blob_cache.as_ref()
    }

    /// IDs of the images currently cached, sorted.
    pub fn cached_image_ids(&self) -> Vec<StorageImageID> {
        let mut ids: Vec<_> = self.cache.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Replace the pin patterns.
    pub fn update_pinned_images(&self, patterns: Vec<String>) {
        *self.pinned.write() = patterns;
    }

    /// List images.
    ///
    /// With a filter, describes the one image it resolves to, or nothing.
    /// Without one, describes every image and rebuilds the cache. Images that
    /// are still arriving are left out.
    #[tracing::instrument(skip(self))]
    pub async fn list_images(&self, filter: Option<&str>) -> Result<Vec<ImageResult>> {
        if let Some(filter) = filter {
            return match self.image_status(filter).await {
                Ok(result) => Ok(vec![result]),
                Err(error) if error.is_not_found() => Ok(Vec::new()),
                Err(error) => Err(error),
            };
        }

        let records = self
            .store
            .images()
            .await
            .map_err(Error::store("list images"))?;
        let previous = self.cache.load_full();
        let mut fresh = ImageCache::with_capacity(records.len());
        let mut results = Vec::with_capacity(records.len());

        for record in records {
            let id = StorageImageID::parse(&record.id).map_err(Error::reference(&record.id))?;
            let item = match previous.get(&id) {
                Some(item) => item.clone(),
                None => match self.build_cache_item(&record).await {
                    Ok(item) => Arc::new(item),
                    Err(error) if error.is_not_found() && self.pulls.any_pulling(&record.names) => {
                        tracing::debug!(image = %record.id, "skipping image that is still being pulled");
                        continue;
                    }
                    Err(error) => return Err(error),
                },
            };
            results.push(self.image_result(&record, id.clone(), &item));
            fresh.insert(id, item);
        }

        self.cache.store(Arc::new(fresh));
        Ok(results)
    }

    /// Describe the image `name_or_id` resolves to.
    ///
    /// The metadata is computed fresh and not added to the cache.
    #[tracing::instrument(skip(self))]
    pub async fn image_status(&self, name_or_id: &str) -> Result<ImageResult> {
        let (record, _) = self.lookup(name_or_id).await?;
        self.status_of(record).await.map(|(result, _)| result)
    }

    /// Describe a local image.
    #[tracing::instrument(skip(self), fields(id = id.id_string_for_out_of_process_consumption_only()))]
    pub async fn image_status_by_id(&self, id: &StorageImageID) -> Result<ImageResult> {
        let record = self.record_by_id(id).await?;
        self.status_of(record).await.map(|(result, _)| result)
    }

    /// Describe the local image stored under `name`.
    #[tracing::instrument(skip(self))]
    pub async fn image_status_by_name(&self, name: &RegistryImageReference) -> Result<ImageResult> {
        let record = self.record_by_name(name).await?;
        self.status_of(record).await.map(|(result, _)| result)
    }

    /// Resolve `name_or_id` and load its metadata into the cache, without
    /// pulling.
    #[tracing::instrument(skip(self))]
    pub async fn prepare_image(&self, name_or_id: &str) -> Result<ImageResult> {
        let (record, _) = self.lookup(name_or_id).await?;
        let (result, item) = self.status_of(record).await?;
        let id = result.id.clone();
        self.cache.rcu(|current| {
            let mut next = ImageCache::clone(current);
            next.insert(id.clone(), item.clone());
            next
        });
        Ok(result)
    }

    /// Pull `reference` into the store.
    ///
    /// The source gets the default transport. The reference in the outcome
    /// is pinned to the manifest digest that was stored.
    #[tracing::instrument(skip(self, options), fields(reference = %reference.string_for_out_of_process_consumption_only()))]
    pub async fn pull_image(
        &self,
        reference: &RegistryImageReference,
        options: &PullOptions,
    ) -> Result<PullOutcome> {
        self.config.policy.check(reference)?;

        let canonical = reference.string_for_out_of_process_consumption_only();
        let source = with_default_transport(&canonical, &self.config.default_transport);
        let _pulling = self.pulls.register(canonical);

        let isolated = self.config.isolated_pull.enabled && {
            let supported = self.cgroup.supported();
            if !supported {
                tracing::warn!("isolated pulls need cgroup v2, pulling in process instead");
            }
            supported
        };

        let (image_id, manifest_digest, warnings) = if isolated {
            self.pull_in_worker(&source, reference, options).await?
        } else {
            self.pull_in_process(&source, reference, options).await?
        };

        let reference = match manifest_digest {
            Some(digest) => reference.with_digest(digest),
            None => reference.clone(),
        };
        tracing::info!(
            image = image_id.id_string_for_out_of_process_consumption_only(),
            "pulled image"
        );
        Ok(PullOutcome {
            reference,
            image_id,
            warnings,
        })
    }

    async fn pull_in_process(
        &self,
        source: &str,
        reference: &RegistryImageReference,
        options: &PullOptions,
    ) -> Result<(StorageImageID, Option<Digest>, Vec<String>)> {
        let mut destination = StoreDestination::new(self.store.clone(), reference.clone());
        if let Some(progress) = &options.progress {
            destination = destination.with_progress(progress.clone());
        }

        let (copied, mut destination, warnings) = match &self.blob_cache {
            Some(cache) => {
                let mut caching = CachingDestination::new(
                    destination,
                    cache.clone(),
                    reference.registry(),
                    reference.repository(),
                    options.cancel.clone(),
                );
                let copied = self.copy(source, options, &mut caching).await;
                let warnings = caching.take_warnings();
                (copied, caching.into_inner(), warnings)
            }
            None => {
                let copied = self.copy(source, options, &mut destination).await;
                (copied, destination, Vec::new())
            }
        };

        if let Err(error) = copied {
            destination.discard().await;
            return Err(error);
        }
        let committed = destination.committed().cloned().ok_or_else(|| Error::InvalidImage {
            image: source.to_owned(),
            reason: "the transport finished without committing the image".into(),
        })?;
        Ok((
            committed.image_id,
            Some(committed.manifest_digest),
            warnings,
        ))
    }

    async fn copy(
        &self,
        source: &str,
        options: &PullOptions,
        destination: &mut dyn ImageDestination,
    ) -> Result<()> {
        let cancel: &CancellationToken = &options.cancel;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            copied = self.transport.copy(source, options.auth_file.as_deref(), destination) => copied,
        }
    }

    async fn pull_in_worker(
        &self,
        source: &str,
        reference: &RegistryImageReference,
        options: &PullOptions,
    ) -> Result<(StorageImageID, Option<Digest>, Vec<String>)> {
        let job = PullJob {
            image: source.to_owned(),
            source_auth_file: options.auth_file.clone(),
            registry: reference.registry().to_owned(),
            repository: reference.repository().to_owned(),
        };
        let report = pull_isolated(
            &self.config.isolated_pull,
            self.mover.as_deref(),
            &job,
            options,
        )
        .await?;

        // The worker wrote through its own handle on the same roots.
        self.store
            .reload()
            .await
            .map_err(Error::store("reload storage after an isolated pull"))?;

        let image_id = report
            .image_id
            .ok_or_else(|| Error::PullProtocol("the worker did not name the image".into()))?;
        let image_id = StorageImageID::parse(&image_id).map_err(Error::reference(&image_id))?;
        let record = self.record_by_id(&image_id).await?;
        let manifest_digest = record.digest.as_deref().and_then(|d| d.parse().ok());
        Ok((image_id, manifest_digest, report.warnings))
    }

    /// Remove one name from an image, or delete the image when `name_or_id`
    /// is a prefix of its ID or the name was its last.
    #[tracing::instrument(skip(self))]
    pub async fn untag_image(&self, name_or_id: &str) -> Result<()> {
        let (record, reference) = self.lookup(name_or_id).await?;
        let id = StorageImageID::parse(&record.id).map_err(Error::reference(&record.id))?;

        if !record.id.starts_with(name_or_id) {
            let name = reference
                .map(|r| r.string_for_out_of_process_consumption_only())
                .unwrap_or_else(|| name_or_id.to_owned());
            let pruned: Vec<String> = record
                .names
                .iter()
                .filter(|existing| **existing != name && existing.as_str() != name_or_id)
                .cloned()
                .collect();
            if !pruned.is_empty() {
                return self
                    .store
                    .set_names(&record.id, &pruned)
                    .await
                    .map_err(Error::store(format!("untag image {}", record.id)));
            }
        }

        self.delete_image(&id).await
    }

    /// Delete a local image and drop it from the cache.
    #[tracing::instrument(skip(self), fields(id = id.id_string_for_out_of_process_consumption_only()))]
    pub async fn delete_image(&self, id: &StorageImageID) -> Result<()> {
        let raw = id.id_string_for_out_of_process_consumption_only();
        let layers = self
            .store
            .delete_image(raw)
            .await
            .map_err(Error::store(format!("delete image {raw}")))?;
        tracing::debug!(?layers, "deleted image");

        self.cache.rcu(|current| {
            let mut next = ImageCache::clone(current);
            next.remove(id);
            next
        });
        Ok(())
    }

    /// Remove an image by name or ID.
    ///
    /// A name is untagged. An ID deletes the image, unless several names
    /// refer to it and `force` is not set.
    #[tracing::instrument(skip(self))]
    pub async fn remove_image(&self, name_or_id: &str, force: bool) -> Result<()> {
        match self.resolve_names(name_or_id).await? {
            Resolved::ImageId(id) => {
                let record = self.record_by_id(&id).await?;
                if record.names.len() > 1 && !force {
                    return Err(Error::ImageMultiplyTagged(name_or_id.to_owned()));
                }
                self.delete_image(&id).await
            }
            Resolved::Candidates(_) => self.untag_image(name_or_id).await,
        }
    }

    /// Work out what `name` refers to.
    ///
    /// A local ID prefix wins. Anything else must parse as an image name
    /// and expands to pull candidates.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_names(&self, name: &str) -> Result<Resolved> {
        if let Some(id) = self
            .heuristically_try_resolving_string_as_id_prefix(name)
            .await
        {
            return Ok(Resolved::ImageId(id));
        }
        self.candidates_for_potentially_short_image_name(name)
            .map(Resolved::Candidates)
    }

    /// The local image whose ID starts with `input`, if `input` could be an
    /// ID prefix at all.
    pub async fn heuristically_try_resolving_string_as_id_prefix(
        &self,
        input: &str,
    ) -> Option<StorageImageID> {
        if input.len() < MINIMUM_TRUNCATED_ID_LENGTH || input.contains(['@', ':']) {
            return None;
        }
        match self.store.image(input).await {
            Ok(record) if record.id.starts_with(input) => StorageImageID::parse(&record.id).ok(),
            Ok(_) => None,
            Err(error) => {
                tracing::trace!(%input, "not an image ID prefix: {error}");
                None
            }
        }
    }

    /// Registry references `name` may mean, most preferred first.
    ///
    /// Qualified names mean themselves. Short names go through the aliases,
    /// then the unqualified-search registries.
    pub fn candidates_for_potentially_short_image_name(
        &self,
        name: &str,
    ) -> Result<Vec<RegistryImageReference>> {
        let parsed = ImageName::parse(name).map_err(|error| match error {
            ReferenceError::LooksLikeImageId(input) => Error::CannotParseImageID(input),
            other => Error::reference(name)(other),
        })?;

        if !parsed.is_short_name() {
            let reference = RegistryImageReference::from_qualified(&parsed.normalized())
                .map_err(Error::reference(name))?;
            return Ok(vec![reference]);
        }

        if let Some(alias) = self.config.short_name_aliases.get(parsed.path()) {
            let target = ImageName::parse(alias).map_err(Error::reference(alias))?;
            let mut qualified = alias.clone();
            if target.tag().is_none() && target.digest().is_none() {
                if let Some(tag) = parsed.tag() {
                    qualified.push(':');
                    qualified.push_str(tag);
                }
                if let Some(digest) = parsed.digest() {
                    qualified.push('@');
                    qualified.push_str(&digest.to_string());
                }
            }
            let reference = RegistryImageReference::parse_qualified(&qualified)
                .map_err(Error::reference(alias))?;
            tracing::debug!(%name, alias = %qualified, "resolved short name through an alias");
            return Ok(vec![reference]);
        }

        if self.config.unqualified_search_registries.is_empty() {
            return Err(Error::ShortNameUnresolvable(name.to_owned()));
        }
        self.config
            .unqualified_search_registries
            .iter()
            .map(|registry| {
                RegistryImageReference::from_qualified(&parsed.with_domain(registry))
                    .map_err(Error::reference(name))
            })
            .collect()
    }

    /// Drop cached blobs no stored manifest refers to.
    ///
    /// Returns `None` when there is no blob cache, or while pulls are
    /// running and their layers are not referenced yet.
    #[tracing::instrument(skip(self))]
    pub async fn prune_blob_cache(&self) -> Result<Option<GcStats>> {
        let Some(cache) = &self.blob_cache else {
            return Ok(None);
        };
        if !self.pulls.is_idle() {
            tracing::debug!("pulls are running, not pruning the blob cache");
            return Ok(None);
        }

        let mut referenced = HashSet::new();
        let records = self
            .store
            .images()
            .await
            .map_err(Error::store("list images"))?;
        for record in records {
            let manifest = match self
                .store
                .image_big_data(&record.id, IMAGE_DIGEST_BIG_DATA_KEY)
                .await
            {
                Ok(manifest) => manifest,
                Err(error) if error.is_not_found() => continue,
                Err(error) => {
                    return Err(Error::store(format!("read manifest of image {}", record.id))(
                        error,
                    ))
                }
            };
            let manifest = parse_manifest(&record.id, &manifest)?;
            referenced.extend(manifest.layers().iter().map(|layer| layer.digest().to_string()));
        }

        let stats = cache.garbage_collect(&referenced).await?;
        tracing::info!(
            removed = stats.blobs_removed,
            freed = stats.bytes_freed,
            "pruned blob cache"
        );
        Ok(Some(stats))
    }

    async fn lookup(
        &self,
        name_or_id: &str,
    ) -> Result<(ImageRecord, Option<RegistryImageReference>)> {
        match self.resolve_names(name_or_id).await? {
            Resolved::ImageId(id) => Ok((self.record_by_id(&id).await?, None)),
            Resolved::Candidates(candidates) => {
                for candidate in candidates {
                    match self.record_by_name(&candidate).await {
                        Ok(record) => return Ok((record, Some(candidate))),
                        Err(error) if error.is_not_found() => {}
                        Err(error) => return Err(error),
                    }
                }
                Err(Error::ImageUnknown(name_or_id.to_owned()))
            }
        }
    }

    async fn record_by_id(&self, id: &StorageImageID) -> Result<ImageRecord> {
        let raw = id.id_string_for_out_of_process_consumption_only();
        self.store
            .image(raw)
            .await
            .map_err(Error::store(format!("look up image {raw}")))
    }

    /// Images are stored under canonical names. A digested reference also
    /// matches an image of the same repository known by that manifest digest.
    async fn record_by_name(&self, name: &RegistryImageReference) -> Result<ImageRecord> {
        let canonical = name.string_for_out_of_process_consumption_only();
        match self.store.image(&canonical).await {
            Ok(record) => return Ok(record),
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(Error::store(format!("look up image {canonical}"))(error)),
        }

        let Some(digest) = name.digest() else {
            return Err(Error::ImageUnknown(canonical));
        };
        let repository = name.name();
        let records = self
            .store
            .images()
            .await
            .map_err(Error::store("list images"))?;
        records
            .into_iter()
            .find(|record| {
                let same_repository = record.names.iter().any(|stored| {
                    stored
                        .strip_prefix(&repository)
                        .is_some_and(|rest| rest.starts_with([':', '@']))
                });
                same_repository && names::image_digests(record).contains(digest)
            })
            .ok_or(Error::ImageUnknown(canonical))
    }

    async fn status_of(&self, record: ImageRecord) -> Result<(ImageResult, Arc<ImageCacheItem>)> {
        let id = StorageImageID::parse(&record.id).map_err(Error::reference(&record.id))?;
        let item = Arc::new(self.build_cache_item(&record).await?);
        Ok((self.image_result(&record, id, &item), item))
    }

    async fn build_cache_item(&self, record: &ImageRecord) -> Result<ImageCacheItem> {
        let id = &record.id;
        let manifest = self
            .store
            .image_big_data(id, IMAGE_DIGEST_BIG_DATA_KEY)
            .await
            .map_err(Error::store(format!("read manifest of image {id}")))?;
        let manifest = parse_manifest(id, &manifest)?;

        let config_key = manifest.config().digest().to_string();
        let config_digest: Digest = config_key.parse().map_err(Error::reference(&config_key))?;
        let config = self
            .store
            .image_big_data(id, &config_key)
            .await
            .map_err(Error::store(format!("read configuration of image {id}")))?;
        let config =
            ImageConfiguration::from_reader(&config[..]).map_err(|error| Error::InvalidImage {
                image: id.clone(),
                reason: format!("unreadable configuration: {error}"),
            })?;

        let size = match self.store.image_size(id).await {
            Ok(size) => Some(size),
            Err(error) => {
                tracing::debug!(image = %id, "size unknown: {error}");
                None
            }
        };

        Ok(ImageCacheItem {
            config: Arc::new(config),
            config_digest,
            size,
        })
    }

    fn image_result(
        &self,
        record: &ImageRecord,
        id: StorageImageID,
        item: &ImageCacheItem,
    ) -> ImageResult {
        let sorted = sort_names_by_type(&record.names);
        let (digest, repo_digests) = make_repo_digests(&sorted.digests, &sorted.tags, record);
        let some_name_of_this_image = sorted
            .best
            .as_deref()
            .and_then(|name| RegistryImageReference::parse_qualified(name).ok());

        let (user, labels) = match item.config.config() {
            Some(config) => (
                config.user().clone().unwrap_or_default(),
                config.labels().clone().unwrap_or_default(),
            ),
            None => (String::new(), HashMap::new()),
        };

        ImageResult {
            id,
            some_name_of_this_image,
            repo_tags: sorted.tags,
            repo_digests,
            size: item.size,
            digest,
            config_digest: item.config_digest.clone(),
            user,
            labels,
            previous_names: record.names_history.clone(),
            oci_config: item.config.clone(),
            pinned: matches_pinned(&self.pinned.read(), &record.names),
        }
    }
}

fn parse_manifest(id: &str, data: &[u8]) -> Result<ImageManifest> {
    ImageManifest::from_reader(data).map_err(|error| Error::InvalidImage {
        image: id.to_owned(),
        reason: format!("unreadable manifest: {error}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolatedPullConfig;
    use crate::policy::PolicyRequirement;
    use crate::testing::{FakeImage, FakeTransport};
    use camino::Utf8Path;
    use store::MemoryStore;

    const APP: &str = "quay.io/test/app:v1";

    fn config() -> ImageServerConfig {
        ImageServerConfig {
            unqualified_search_registries: vec!["quay.io".into()],
            ..ImageServerConfig::default()
        }
    }

    async fn server(config: ImageServerConfig) -> (ImageServer, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::default());
        let store = Storage::from(MemoryStore::new("vfs"));
        let server = ImageServer::new(store, transport.clone(), config)
            .await
            .unwrap();
        (server, transport)
    }

    fn reference(name: &str) -> RegistryImageReference {
        RegistryImageReference::parse_qualified(name).unwrap()
    }

    async fn pull(server: &ImageServer, name: &str) -> PullOutcome {
        server
            .pull_image(&reference(name), &PullOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pull_then_describe() {
        let (server, transport) = server(config()).await;
        let image = FakeImage::new(&[b"base", b"app"], "1000");
        transport.insert(APP, image.clone());

        let outcome = pull(&server, APP).await;
        assert_eq!(outcome.image_id, image.id());
        assert_eq!(outcome.reference.digest(), Some(&image.manifest_digest()));
        assert!(outcome.warnings.is_empty());
        assert_eq!(transport.sources(), vec![format!("docker://{APP}")]);

        let status = server.image_status(APP).await.unwrap();
        assert_eq!(status.id, image.id());
        assert_eq!(status.user, "1000");
        assert_eq!(status.labels["org.example.user"], "1000");
        assert_eq!(status.repo_tags, vec![APP.to_string()]);
        assert_eq!(
            status.repo_digests,
            vec![format!("quay.io/test/app@{}", image.manifest_digest())]
        );
        assert_eq!(status.config_digest, image.config_digest());
        assert_eq!(status.digest, Some(image.manifest_digest()));
        assert_eq!(status.some_name_of_this_image, Some(reference(APP)));
        assert!(status.size.is_some());
        assert!(!status.pinned);

        // Status lookups don't populate the cache.
        assert!(server.cached_image_ids().is_empty());
    }

    #[tokio::test]
    async fn status_by_prefix_short_name_and_digest() {
        let (server, transport) = server(config()).await;
        let image = FakeImage::new(&[b"layer"], "0");
        transport.insert(APP, image.clone());
        pull(&server, APP).await;

        let id = image.id();
        let raw = id.id_string_for_out_of_process_consumption_only();
        assert_eq!(server.image_status(&raw[..12]).await.unwrap().id, id);
        assert_eq!(server.image_status("test/app:v1").await.unwrap().id, id);
        assert_eq!(server.image_status_by_id(&id).await.unwrap().id, id);

        let digested = format!("quay.io/test/app@{}", image.manifest_digest());
        assert_eq!(server.image_status(&digested).await.unwrap().id, id);
        let elsewhere = format!("quay.io/other/app@{}", image.manifest_digest());
        assert!(server.image_status(&elsewhere).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unfiltered_listing_replaces_the_cache() {
        let (server, transport) = server(config()).await;
        let first = FakeImage::new(&[b"one"], "1");
        let second = FakeImage::new(&[b"two"], "2");
        transport.insert("quay.io/test/one:v1", first.clone());
        transport.insert("quay.io/test/two:v1", second.clone());
        pull(&server, "quay.io/test/one:v1").await;
        pull(&server, "quay.io/test/two:v1").await;

        assert_eq!(server.list_images(None).await.unwrap().len(), 2);
        assert_eq!(server.cached_image_ids().len(), 2);

        server
            .store()
            .delete_image(first.id().id_string_for_out_of_process_consumption_only())
            .await
            .unwrap();
        let listed = server.list_images(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(server.cached_image_ids(), vec![second.id()]);

        let filtered = server.list_images(Some("quay.io/test/two:v1")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert!(server
            .list_images(Some("quay.io/test/one:v1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn listing_skips_images_still_being_pulled() {
        let (server, _) = server(config()).await;
        let id = FakeImage::new(&[], "partial").id();
        server
            .store()
            .create_image(
                id.id_string_for_out_of_process_consumption_only(),
                &[APP.to_string()],
                None,
                "",
            )
            .await
            .unwrap();

        assert!(server.list_images(None).await.unwrap_err().is_not_found());

        let _pulling = server.pull_registry().register(APP);
        assert!(server.list_images(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolving_names() {
        let mut config = config();
        config
            .short_name_aliases
            .insert("pause".into(), "registry.k8s.io/pause".into());
        let (server, _) = server(config).await;

        let hex = "a".repeat(64);
        assert!(matches!(
            server.resolve_names(&hex).await,
            Err(Error::CannotParseImageID(_))
        ));

        let Resolved::Candidates(candidates) = server.resolve_names("pause:3.10").await.unwrap()
        else {
            panic!("expected candidates");
        };
        assert_eq!(candidates, vec![reference("registry.k8s.io/pause:3.10")]);

        let Resolved::Candidates(candidates) = server.resolve_names("app").await.unwrap() else {
            panic!("expected candidates");
        };
        assert_eq!(candidates, vec![reference("quay.io/app:latest")]);

        let Resolved::Candidates(candidates) =
            server.resolve_names("docker.io/busybox").await.unwrap()
        else {
            panic!("expected candidates");
        };
        assert_eq!(candidates, vec![reference("docker.io/library/busybox:latest")]);

        let (bare, _) = super::tests::server(ImageServerConfig::default()).await;
        assert!(matches!(
            bare.resolve_names("app").await,
            Err(Error::ShortNameUnresolvable(_))
        ));
        assert!(matches!(
            bare.resolve_names("Not/Valid").await,
            Err(Error::Reference { .. })
        ));
    }

    #[tokio::test]
    async fn untag_prunes_names_before_deleting() {
        let (server, transport) = server(config()).await;
        let image = FakeImage::new(&[b"layer"], "0");
        transport.insert(APP, image.clone());
        transport.insert("quay.io/test/app:v2", image.clone());
        pull(&server, APP).await;
        pull(&server, "quay.io/test/app:v2").await;

        let raw = image.id().id_string_for_out_of_process_consumption_only().to_owned();
        assert_eq!(server.store().names(&raw).await.unwrap().len(), 2);

        server.untag_image(APP).await.unwrap();
        assert_eq!(
            server.store().names(&raw).await.unwrap(),
            vec!["quay.io/test/app:v2".to_string()]
        );

        server.untag_image("quay.io/test/app:v2").await.unwrap();
        assert!(server.store().image(&raw).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn untag_by_id_prefix_deletes() {
        let (server, transport) = server(config()).await;
        let image = FakeImage::new(&[b"layer"], "0");
        transport.insert(APP, image.clone());
        pull(&server, APP).await;

        let raw = image.id().id_string_for_out_of_process_consumption_only().to_owned();
        server.untag_image(&raw[..10]).await.unwrap();
        assert!(server.store().images().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_by_id_needs_force_when_multiply_tagged() {
        let (server, transport) = server(config()).await;
        let image = FakeImage::new(&[b"layer"], "0");
        transport.insert(APP, image.clone());
        transport.insert("quay.io/test/app:v2", image.clone());
        pull(&server, APP).await;
        pull(&server, "quay.io/test/app:v2").await;
        server.prepare_image(APP).await.unwrap();
        assert_eq!(server.cached_image_ids(), vec![image.id()]);

        let raw = image.id().id_string_for_out_of_process_consumption_only().to_owned();
        assert!(matches!(
            server.remove_image(&raw, false).await,
            Err(Error::ImageMultiplyTagged(_))
        ));

        server.remove_image(APP, false).await.unwrap();
        assert_eq!(server.store().names(&raw).await.unwrap().len(), 1);

        server
            .remove_image(&raw, false)
            .await
            .unwrap();
        assert!(server.store().images().await.unwrap().is_empty());
        assert!(server.cached_image_ids().is_empty());
    }

    #[tokio::test]
    async fn policy_rejection_happens_before_copying() {
        let mut config = config();
        config
            .policy
            .transports
            .insert("quay.io/test".into(), PolicyRequirement::Reject);
        let (server, transport) = server(config).await;
        transport.insert(APP, FakeImage::new(&[b"layer"], "0"));

        let error = server
            .pull_image(&reference(APP), &PullOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::PolicyRejected(_)));
        assert!(transport.sources().is_empty());
    }

    #[tokio::test]
    async fn failed_and_cancelled_pulls_leave_nothing() {
        let (server, transport) = server(config()).await;
        let error = server
            .pull_image(&reference(APP), &PullOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Transport { .. }));

        transport.insert(APP, FakeImage::new(&[b"layer"], "0"));
        let options = PullOptions::default();
        options.cancel.cancel();
        let error = server.pull_image(&reference(APP), &options).await.unwrap_err();
        assert!(matches!(error, Error::Cancelled));

        assert!(server.store().images().await.unwrap().is_empty());
        assert!(server.pull_registry().is_idle());
    }

    #[tokio::test]
    async fn pinned_patterns_can_change() {
        let mut config = config();
        config.pinned_images = vec!["quay.io/test/*".into()];
        let (server, transport) = server(config).await;
        transport.insert(APP, FakeImage::new(&[b"layer"], "0"));
        pull(&server, APP).await;

        assert!(server.image_status(APP).await.unwrap().pinned);
        server.update_pinned_images(Vec::new());
        assert!(!server.image_status(APP).await.unwrap().pinned);
    }

    #[tokio::test]
    async fn pulls_feed_and_prune_the_blob_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.blob_cache_dir = Some(Utf8Path::from_path(dir.path()).unwrap().to_owned());
        let (server, transport) = server(config).await;
        let image = FakeImage::new(&[b"base", b"app"], "0");
        transport.insert(APP, image.clone());

        pull(&server, APP).await;
        let cache = server.blob_cache().unwrap().clone();
        assert_eq!(cache.list_blobs().await.len(), 2);

        let stats = server.prune_blob_cache().await.unwrap().unwrap();
        assert_eq!(stats.blobs_removed, 0);

        server.delete_image(&image.id()).await.unwrap();
        let stats = server.prune_blob_cache().await.unwrap().unwrap();
        assert_eq!(stats.blobs_removed, 2);
        assert!(cache.list_blobs().await.is_empty());
    }

    #[tokio::test]
    async fn isolated_pull_without_cgroups_runs_in_process() {
        let mut config = config();
        config.isolated_pull = IsolatedPullConfig {
            enabled: true,
            program: "/nonexistent/pull-worker".into(),
            ..IsolatedPullConfig::default()
        };
        let (server, transport) = server(config).await;
        let server = server.with_cgroup_probe(CgroupProbe::fixed(false));
        transport.insert(APP, FakeImage::new(&[b"layer"], "0"));

        pull(&server, APP).await;
        assert_eq!(transport.sources().len(), 1);
    }

    #[tokio::test]
    async fn isolated_pull_uses_the_worker_report() {
        let (server, transport) = server(config()).await;
        let image = FakeImage::new(&[b"layer"], "0");
        transport.insert(APP, image.clone());
        pull(&server, APP).await;

        let raw = image.id().id_string_for_out_of_process_consumption_only().to_owned();
        let script = format!(
            r#"cat >/dev/null; echo '{{"event":"warning","message":"slow"}}'; echo '{{"event":"done","image_id":"{raw}"}}'"#
        );
        let mut config = config();
        config.isolated_pull = IsolatedPullConfig {
            enabled: true,
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script],
            scope_prefix: "test-pull".into(),
        };
        let isolated = ImageServer::new(server.store().clone(), transport.clone(), config)
            .await
            .unwrap()
            .with_cgroup_probe(CgroupProbe::fixed(true));

        let outcome = isolated
            .pull_image(&reference(APP), &PullOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.image_id, image.id());
        assert_eq!(outcome.reference.digest(), Some(&image.manifest_digest()));
        assert_eq!(outcome.warnings, vec!["slow".to_string()]);
        // The worker did the copy, not this process.
        assert_eq!(transport.sources().len(), 1);
    }
}
