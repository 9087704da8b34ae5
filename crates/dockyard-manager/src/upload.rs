//! The `upload` command: put a local archive into the bucket under its artifact path.

use std::path::{Path, PathBuf};

use bytes::Bytes;

use dockyard_core::{
    identify, ArchiveKind, ArtifactIdentity, BucketLocation, StorageBackend, WritePrecondition,
    WriteResult,
};

use crate::error::{Error, Result};

/// A local archive to publish as `<app>/<version>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Local `.tar` or `.tar.gz` file.
    pub file: PathBuf,
    /// Application name.
    pub app: String,
    /// Version.
    pub version: String,
}

/// Where an archive landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uploaded {
    /// Identity the watcher will derive from the object.
    pub identity: ArtifactIdentity,
    /// Fully qualified object URL.
    pub url: String,
    /// Bytes written.
    pub size: u64,
}

/// Derives the artifact identity `request` would be uploaded as.
///
/// The archive kind comes from the local file's extension.
///
/// # Errors
///
/// Returns [`Error::UploadRefused`] if the extension is not `.tar`/`.tar.gz`
/// or the resulting path would not be accepted by the watcher.
pub fn target_identity(request: &UploadRequest) -> Result<ArtifactIdentity> {
    let file_name = request
        .file
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let Some((_, kind)) = ArchiveKind::split_file_name(file_name) else {
        return Err(Error::upload_refused(format!(
            "{} must end in .tar or .tar.gz",
            request.file.display()
        )));
    };

    let path = format!("{}/{}{}", request.app, request.version, kind.extension());
    identify(&path).map_err(|e| Error::upload_refused(e.to_string()))
}

/// Uploads `request` to `storage`, never overwriting an existing artifact.
///
/// Both archive kinds of the same `(app, version)` are checked, since the
/// ledger treats them as one artifact.
///
/// # Errors
///
/// Returns [`Error::UploadRefused`] if the path is invalid or an artifact for
/// the identity already exists, [`Error::Io`] if the file cannot be read, and
/// a storage error if the bucket cannot be reached.
pub async fn upload(
    storage: &dyn StorageBackend,
    location: &BucketLocation,
    request: &UploadRequest,
) -> Result<Uploaded> {
    let identity = target_identity(request)?;

    for kind in [ArchiveKind::Tar, ArchiveKind::TarGz] {
        let existing = format!(
            "{}/{}{}",
            identity.application_name(),
            identity.version(),
            kind.extension()
        );
        if storage.head(&existing).await?.is_some() {
            return Err(Error::upload_refused(format!(
                "{} already exists; artifacts are immutable, upload a new version",
                location.object_url(&existing)
            )));
        }
    }

    let data = read_file(&request.file).await?;
    let size = data.len() as u64;
    let path = identity.source_path().to_string();

    match storage
        .put(&path, data, WritePrecondition::DoesNotExist)
        .await?
    {
        WriteResult::Success { .. } => {}
        WriteResult::PreconditionFailed { .. } => {
            return Err(Error::upload_refused(format!(
                "{} was created concurrently",
                location.object_url(&path)
            )));
        }
    }

    let url = location.object_url(&path);
    tracing::info!(%url, size, "artifact uploaded");
    Ok(Uploaded {
        identity,
        url,
        size,
    })
}

async fn read_file(path: &Path) -> Result<Bytes> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(file: &str, app: &str, version: &str) -> UploadRequest {
        UploadRequest {
            file: PathBuf::from(file),
            app: app.to_string(),
            version: version.to_string(),
        }
    }

    #[test]
    fn kind_follows_local_extension() {
        let identity =
            target_identity(&request("/tmp/build/site.tar.gz", "widgets", "v1.0")).expect("valid");
        assert_eq!(identity.source_path(), "widgets/v1.0.tar.gz");
        assert_eq!(identity.archive_kind(), ArchiveKind::TarGz);

        let identity = target_identity(&request("out.tar", "widgets", "v2")).expect("valid");
        assert_eq!(identity.source_path(), "widgets/v2.tar");
    }

    #[test]
    fn zip_is_refused() {
        let err = target_identity(&request("site.zip", "widgets", "v1")).expect_err("zip");
        assert!(matches!(err, Error::UploadRefused { .. }));
    }

    #[test]
    fn illegal_names_are_refused_before_upload() {
        assert!(target_identity(&request("a.tar", "Widgets App", "v1")).is_err());
        assert!(target_identity(&request("a.tar", "widgets", "")).is_err());
        assert!(target_identity(&request("a.tar", "widgets", "v1/rc")).is_err());
    }
}
