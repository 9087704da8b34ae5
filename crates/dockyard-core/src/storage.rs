//! Storage backend abstraction for object storage (GCS, S3, local files).
//!
//! Two things live behind this contract:
//! - the **artifact bucket** the watcher lists, and
//! - the **ledger**, which needs conditional writes to detect a second writer.
//!
//! ## Version tokens
//!
//! The version token returned by writes and metadata is an opaque `String`:
//! - GCS/S3: the entity tag and, when the store reports one, the object
//!   version (GCS generation); conditional updates on GCS need the latter
//! - Local files: a tag derived from inode, size and modification time
//! - Memory: a monotonically increasing counter

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::aws::S3ConditionalPut;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if object does not exist.
    DoesNotExist,
    /// Write only if object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns current version token.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object path (key), relative to the backend root.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for object storage.
///
/// All storage backends (GCS, S3, local, memory) implement this trait.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with an optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if the precondition is not met.
    /// Never returns an error for a precondition failure - that's a normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Lists objects with the given prefix (`""` lists everything).
    ///
    /// **Ordering**: results come back in arbitrary order. Callers requiring
    /// deterministic order should sort by `path`.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

// ============================================================================
// Bucket locations
// ============================================================================

/// Where a backend stores its objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketLocation {
    /// Google Cloud Storage bucket with an optional key prefix.
    Gcs {
        /// Bucket name.
        bucket: String,
        /// Key prefix inside the bucket (no leading or trailing `/`).
        prefix: Option<String>,
    },
    /// Amazon S3 (or compatible) bucket with an optional key prefix.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Key prefix inside the bucket (no leading or trailing `/`).
        prefix: Option<String>,
    },
    /// Directory on the local filesystem.
    Local(PathBuf),
    /// Process-local memory (tests and dry runs only).
    Memory,
}

impl BucketLocation {
    /// Parses a bucket identifier.
    ///
    /// Accepts `my-bucket` (GCS), `gs://my-bucket/prefix`, `s3://my-bucket/prefix`,
    /// `file:///absolute/dir` and `memory://`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for empty identifiers, unknown schemes or
    /// relative file paths.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::configuration("bucket identifier is empty"));
        }

        if raw == "memory://" || raw == "memory" {
            return Ok(Self::Memory);
        }

        if let Some(rest) = raw.strip_prefix("file://") {
            let path = PathBuf::from(rest);
            if !path.is_absolute() {
                return Err(Error::configuration(format!(
                    "file location must be absolute (got {raw})"
                )));
            }
            return Ok(Self::Local(path));
        }

        if !raw.contains("://") {
            return Ok(Self::Gcs {
                bucket: raw.trim_matches('/').to_string(),
                prefix: None,
            });
        }

        let url = url::Url::parse(raw)
            .map_err(|e| Error::configuration(format!("invalid bucket URL '{raw}': {e}")))?;
        let bucket = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::configuration(format!("bucket URL '{raw}' has no bucket")))?
            .to_string();
        let prefix = Some(url.path().trim_matches('/').to_string()).filter(|p| !p.is_empty());

        match url.scheme() {
            "gs" => Ok(Self::Gcs { bucket, prefix }),
            "s3" => Ok(Self::S3 { bucket, prefix }),
            other => Err(Error::configuration(format!(
                "unsupported storage scheme '{other}' in '{raw}'"
            ))),
        }
    }

    /// Returns the fully qualified URL of an object stored at `path`.
    ///
    /// This is the form handed to out-of-process consumers such as build jobs.
    #[must_use]
    pub fn object_url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        match self {
            Self::Gcs { bucket, prefix } => format!("gs://{bucket}/{}", join(prefix.as_deref(), path)),
            Self::S3 { bucket, prefix } => format!("s3://{bucket}/{}", join(prefix.as_deref(), path)),
            Self::Local(dir) => format!("file://{}", dir.join(path).display()),
            Self::Memory => format!("memory:///{path}"),
        }
    }
}

impl fmt::Display for BucketLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gcs { bucket, prefix } => write!(f, "gs://{bucket}/{}", prefix.as_deref().unwrap_or("")),
            Self::S3 { bucket, prefix } => write!(f, "s3://{bucket}/{}", prefix.as_deref().unwrap_or("")),
            Self::Local(dir) => write!(f, "file://{}", dir.display()),
            Self::Memory => f.write_str("memory://"),
        }
    }
}

fn join(prefix: Option<&str>, path: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}/{path}"),
        None => path.to_string(),
    }
}

// ============================================================================
// object_store backend
// ============================================================================

/// Storage backend over the `object_store` crate.
///
/// Credentials are discovered from the environment (application default
/// credentials for GCS, the standard AWS variables for S3).
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    location: BucketLocation,
    /// Local filesystems cannot perform conditional updates; they are emulated
    /// with compare-then-write, which is only sound with a single writer.
    native_conditional_updates: bool,
}

impl fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("location", &self.location)
            .field("native_conditional_updates", &self.native_conditional_updates)
            .finish_non_exhaustive()
    }
}

impl ObjectStoreBackend {
    /// Creates a backend from a bucket identifier (see [`BucketLocation::parse`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is invalid or the client cannot be built.
    pub fn from_bucket(raw: &str) -> Result<Self> {
        Self::from_location(BucketLocation::parse(raw)?)
    }

    /// Creates a backend for a parsed location.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be built or a local directory
    /// cannot be created.
    pub fn from_location(location: BucketLocation) -> Result<Self> {
        let (store, native_conditional_updates): (Arc<dyn ObjectStore>, bool) = match &location {
            BucketLocation::Gcs { bucket, prefix } => {
                let store = object_store::gcp::GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(bucket)
                    .build()
                    .map_err(|e| {
                        Error::configuration(format!("failed to build GCS client for '{bucket}': {e}"))
                    })?;
                (with_prefix(store, prefix.as_deref()), true)
            }
            BucketLocation::S3 { bucket, prefix } => {
                let store = object_store::aws::AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_conditional_put(S3ConditionalPut::ETagMatch)
                    .build()
                    .map_err(|e| {
                        Error::configuration(format!("failed to build S3 client for '{bucket}': {e}"))
                    })?;
                (with_prefix(store, prefix.as_deref()), true)
            }
            BucketLocation::Local(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    Error::configuration(format!("failed to create {}: {e}", dir.display()))
                })?;
                let store = object_store::local::LocalFileSystem::new_with_prefix(dir)
                    .map_err(|e| {
                        Error::configuration(format!("failed to open {}: {e}", dir.display()))
                    })?;
                (Arc::new(store), false)
            }
            BucketLocation::Memory => (Arc::new(object_store::memory::InMemory::new()), true),
        };

        Ok(Self {
            store,
            location,
            native_conditional_updates,
        })
    }

    /// Returns the location this backend reads and writes.
    #[must_use]
    pub fn location(&self) -> &BucketLocation {
        &self.location
    }

    async fn put_mode(&self, path: &StorePath, data: Bytes, mode: PutMode) -> Result<WriteResult> {
        let options = PutOptions {
            mode,
            ..PutOptions::default()
        };
        match self.store.put_opts(path, PutPayload::from(data), options).await {
            Ok(result) => Ok(WriteResult::Success {
                version: encode_version(result.e_tag, result.version),
            }),
            Err(
                object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. },
            ) => {
                let current_version = self
                    .head(path.as_ref())
                    .await?
                    .map_or_else(|| "0".to_string(), |meta| meta.version);
                Ok(WriteResult::PreconditionFailed { current_version })
            }
            Err(e) => Err(Error::storage_with_source(
                format!("put {path} failed"),
                e,
            )),
        }
    }
}

fn with_prefix<T: ObjectStore>(store: T, prefix: Option<&str>) -> Arc<dyn ObjectStore> {
    match prefix {
        Some(prefix) => Arc::new(object_store::prefix::PrefixStore::new(store, prefix)),
        None => Arc::new(store),
    }
}

/// Marks a token carrying an object version.
const VERSION_MARK: &str = "v:";

/// Encodes what a conditional update needs to send back.
///
/// `v:<version>|<etag>` when both are known, `v:<version>` or `<etag>` alone
/// otherwise. Object versions never contain `|`.
fn encode_version(e_tag: Option<String>, version: Option<String>) -> String {
    match (e_tag, version) {
        (Some(tag), Some(version)) => format!("{VERSION_MARK}{version}|{tag}"),
        (Some(tag), None) => tag,
        (None, Some(version)) => format!("{VERSION_MARK}{version}"),
        (None, None) => String::new(),
    }
}

fn decode_version(token: &str) -> UpdateVersion {
    let Some(marked) = token.strip_prefix(VERSION_MARK) else {
        return UpdateVersion {
            e_tag: Some(token.to_string()),
            version: None,
        };
    };
    match marked.split_once('|') {
        Some((version, tag)) => UpdateVersion {
            e_tag: Some(tag.to_string()),
            version: Some(version.to_string()),
        },
        None => UpdateVersion {
            e_tag: None,
            version: Some(marked.to_string()),
        },
    }
}

fn convert_meta(meta: object_store::ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        path: meta.location.to_string(),
        size: u64::try_from(meta.size).unwrap_or(u64::MAX),
        version: encode_version(meta.e_tag, meta.version),
        last_modified: Some(meta.last_modified),
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let location = StorePath::from(path);
        match self.store.get(&location).await {
            Ok(result) => result
                .bytes()
                .await
                .map_err(|e| Error::storage_with_source(format!("read {path} failed"), e)),
            Err(object_store::Error::NotFound { .. }) => {
                Err(Error::NotFound(format!("object not found: {path}")))
            }
            Err(e) => Err(Error::storage_with_source(format!("get {path} failed"), e)),
        }
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let location = StorePath::from(path);
        match precondition {
            WritePrecondition::None => self.put_mode(&location, data, PutMode::Overwrite).await,
            WritePrecondition::DoesNotExist => self.put_mode(&location, data, PutMode::Create).await,
            WritePrecondition::MatchesVersion(expected) if self.native_conditional_updates => {
                self.put_mode(&location, data, PutMode::Update(decode_version(&expected)))
                    .await
            }
            WritePrecondition::MatchesVersion(expected) => {
                match self.head(path).await? {
                    Some(meta) if meta.version == expected => {
                        self.put_mode(&location, data, PutMode::Overwrite).await
                    }
                    Some(meta) => Ok(WriteResult::PreconditionFailed {
                        current_version: meta.version,
                    }),
                    None => Ok(WriteResult::PreconditionFailed {
                        current_version: "0".to_string(),
                    }),
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let prefix = Some(prefix.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(StorePath::from);
        self.store
            .list(prefix.as_ref())
            .map_ok(convert_meta)
            .try_collect()
            .await
            .map_err(|e| Error::storage_with_source(format!("list {} failed", self.location), e))
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        match self.store.head(&StorePath::from(path)).await {
            Ok(meta) => Ok(Some(convert_meta(meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(Error::storage_with_source(format!("head {path} failed"), e)),
        }
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
/// Uses numeric versions internally (stored as strings) to simulate GCS-like behavior.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    fail_listing: Arc<RwLock<Option<String>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `list` call fail with `message` (or succeed again
    /// with `None`). Simulates an unreachable bucket.
    pub fn set_listing_failure(&self, message: Option<&str>) {
        if let Ok(mut guard) = self.fail_listing.write() {
            *guard = message.map(str::to_string);
        }
    }

    fn meta(path: &str, obj: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: obj.data.len() as u64,
            version: obj.version.to_string(),
            last_modified: Some(obj.last_modified),
        }
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        if let Some(message) = self.fail_listing.read().map_err(|_| poisoned())?.clone() {
            return Err(Error::storage(message));
        }

        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| Self::meta(path, obj))
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|obj| Self::meta(path, obj)))
    }
}
