//! Several storage-driver-backed stores presented as one, always consulting
//! the default driver first.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use store_driver::{ContainerRecord, Store, StoreError, StoreErrorKind};

use crate::Storage;

const ENGINE: &str = "multi";

/// An error from one backend of a composite.
#[derive(Debug)]
pub struct BackendError<E> {
    /// Driver name of the failing backend.
    pub driver: String,
    /// What went wrong.
    pub error: E,
}

impl<E: fmt::Display> fmt::Display for BackendError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.driver, self.error)
    }
}

impl<E> StdError for BackendError<E>
where
    E: StdError + 'static,
{
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.error)
    }
}

/// Every per-backend failure of one aggregate operation.
#[derive(Debug)]
pub struct MultiError<E> {
    errors: Vec<BackendError<E>>,
}

impl<E> MultiError<E> {
    /// The individual failures, in backend order.
    pub fn errors(&self) -> &[BackendError<E>] {
        &self.errors
    }

    /// Consume into the individual failures.
    pub fn into_errors(self) -> Vec<BackendError<E>> {
        self.errors
    }
}

impl<E: fmt::Display> fmt::Display for MultiError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (n, error) in self.errors.iter().enumerate() {
            if n > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl<E> StdError for MultiError<E>
where
    E: StdError + 'static,
{
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.errors.first().map(|e| e as &(dyn StdError + 'static))
    }
}

/// Results of an operation run against every backend.
///
/// A failing backend does not hide what the others returned.
#[derive(Debug)]
pub struct Gathered<T, E> {
    /// Everything the successful backends returned.
    pub items: Vec<T>,
    /// One entry per failed backend.
    pub errors: Vec<BackendError<E>>,
}

impl<T, E> Default for Gathered<T, E> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T, E> Gathered<T, E> {
    /// Record one backend's outcome.
    pub fn push(&mut self, driver: &str, result: Result<Vec<T>, E>) {
        match result {
            Ok(items) => self.items.extend(items),
            Err(error) => self.errors.push(BackendError {
                driver: driver.to_owned(),
                error,
            }),
        }
    }

    /// True when every backend succeeded.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Split into the partial results and the aggregate error, if any.
    pub fn split(self) -> (Vec<T>, Option<MultiError<E>>) {
        let error = if self.errors.is_empty() {
            None
        } else {
            Some(MultiError {
                errors: self.errors,
            })
        };
        (self.items, error)
    }

    /// All results, or the aggregate error if any backend failed.
    pub fn into_result(self) -> Result<Vec<T>, MultiError<E>> {
        match self.split() {
            (items, None) => Ok(items),
            (_, Some(error)) => Err(error),
        }
    }
}

/// Stores keyed by driver name, with a designated default.
#[derive(Debug, Clone)]
pub struct MultiStore {
    default: Storage,
    others: BTreeMap<String, Storage>,
}

impl MultiStore {
    /// Compose `stores`, keyed by their driver names.
    ///
    /// Fails if two stores share a driver name or none answers to
    /// `default_driver`.
    pub fn new(
        default_driver: &str,
        stores: impl IntoIterator<Item = Storage>,
    ) -> Result<Self, StoreError> {
        let mut default = None;
        let mut others = BTreeMap::new();

        for store in stores {
            let driver = store.driver_name().to_owned();
            let taken = others.contains_key(&driver)
                || default
                    .as_ref()
                    .is_some_and(|d: &Storage| d.driver_name() == driver);
            if taken {
                return Err(StoreError::builder(
                    ENGINE,
                    StoreErrorKind::Duplicate,
                    format!("storage driver {driver} configured twice"),
                )
                .id(driver)
                .build());
            }

            if driver == default_driver {
                default = Some(store);
            } else {
                others.insert(driver, store);
            }
        }

        let default = default.ok_or_else(|| {
            StoreError::builder(
                ENGINE,
                StoreErrorKind::InvalidRequest,
                format!("default storage driver {default_driver} is not configured"),
            )
            .id(default_driver)
            .build()
        })?;

        Ok(Self { default, others })
    }

    /// A composite over a single store.
    pub fn single(store: Storage) -> Self {
        Self {
            default: store,
            others: BTreeMap::new(),
        }
    }

    /// The default driver's name.
    pub fn default_driver(&self) -> &str {
        self.default.driver_name()
    }

    /// The default driver's store.
    pub fn default_store(&self) -> &Storage {
        &self.default
    }

    /// The store for one driver.
    pub fn get(&self, driver: &str) -> Option<&Storage> {
        if self.default.driver_name() == driver {
            Some(&self.default)
        } else {
            self.others.get(driver)
        }
    }

    /// Every store, default first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Storage)> {
        std::iter::once((self.default.driver_name(), &self.default))
            .chain(self.others.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// Number of configured stores.
    pub fn len(&self) -> usize {
        1 + self.others.len()
    }

    /// Always false: a composite has at least its default store.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The first store, default first, that knows the container.
    #[tracing::instrument(skip(self))]
    pub async fn get_store_for_container(&self, id: &str) -> Result<&Storage, StoreError> {
        for (driver, store) in self.iter() {
            match store.container(id).await {
                Ok(_) => return Ok(store),
                Err(err) if err.is_not_found() => {}
                Err(err) => tracing::debug!(%driver, "container lookup failed: {err}"),
            }
        }
        Err(StoreError::unknown(ENGINE, StoreErrorKind::ContainerUnknown, id))
    }

    /// The first store, default first, that knows the image.
    #[tracing::instrument(skip(self))]
    pub async fn get_store_for_image(&self, id_or_name: &str) -> Result<&Storage, StoreError> {
        for (driver, store) in self.iter() {
            match store.image(id_or_name).await {
                Ok(_) => return Ok(store),
                Err(err) if err.is_not_found() => {}
                Err(err) => tracing::debug!(%driver, "image lookup failed: {err}"),
            }
        }
        Err(StoreError::unknown(ENGINE, StoreErrorKind::ImageUnknown, id_or_name))
    }

    /// Containers of every store.
    #[tracing::instrument(skip(self))]
    pub async fn containers(&self) -> Gathered<ContainerRecord, StoreError> {
        let mut gathered = Gathered::default();
        for (driver, store) in self.iter() {
            gathered.push(driver, store.containers().await);
        }
        gathered
    }

    /// Shut down every store, returning the layers still mounted anywhere.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self, force: bool) -> Gathered<String, StoreError> {
        let mut gathered = Gathered::default();
        for (driver, store) in self.iter() {
            let result = store.shutdown(force).await;
            if let Err(err) = &result {
                tracing::warn!(%driver, "shutdown failed: {err}");
            }
            gathered.push(driver, result);
        }
        gathered
    }
}
