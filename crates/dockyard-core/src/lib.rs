//! # dockyard-core
//!
//! Core abstractions shared by every dockyard component.
//!
//! - **Artifact identity**: mapping a bucket object path to an
//!   `(application, version, archive kind)` triple
//! - **Storage**: an object storage contract with conditional writes, backed by
//!   GCS/S3/local files through `object_store`, plus an in-memory backend for tests
//! - **Identifiers**: correlation IDs that tag every log line of a pipeline attempt
//! - **Errors** and **logging** helpers used across the workspace
//!
//! ## Example
//!
//! ```rust
//! use dockyard_core::prelude::*;
//!
//! let identity = identify("widgets/v1.0.tar.gz").expect("valid artifact path");
//! assert_eq!(identity.application_name(), "widgets");
//! assert_eq!(identity.version(), "v1.0");
//! assert_eq!(identity.archive_kind(), ArchiveKind::TarGz);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod artifact;
pub mod error;
pub mod id;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::artifact::{
        identify, ArchiveKind, ArtifactIdentity, ArtifactKey, InvalidPath, ResourceNameKind,
    };
    pub use crate::error::{Error, Result};
    pub use crate::id::CorrelationId;
    pub use crate::storage::{
        BucketLocation, MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend,
        WritePrecondition, WriteResult,
    };
}

pub use artifact::{
    distinct_resource_name, identify, sanitize_resource_name, ArchiveKind, ArtifactIdentity,
    ArtifactKey, InvalidPath, ResourceNameKind,
};
pub use error::{Error, Result};
pub use id::CorrelationId;
pub use observability::{init_logging, LogFormat};
pub use storage::{
    BucketLocation, MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend,
    WritePrecondition, WriteResult,
};
