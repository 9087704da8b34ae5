//! Artifact identity derived from bucket object paths.
//!
//! Uploads land at `<application>/<version>.tar` or `<application>/<version>.tar.gz`.
//! [`identify`] turns such a path into an [`ArtifactIdentity`]; anything else is an
//! [`InvalidPath`] and is never processed.
//!
//! Application names and versions are restricted to lowercase ASCII alphanumerics,
//! `-` and `.`, and must start and end with an alphanumeric. That keeps them legal
//! both as image tags and (after [`distinct_resource_name`]) as cluster resource names.
//!
//! Sanitising can map two identities onto one name (`v1.0` and `v1-0` are the same
//! DNS label). Whenever a name differs from its raw form it carries a short digest
//! of the raw form, so distinct identities keep distinct names.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest version accepted; image tags are limited to 128 characters.
pub const MAX_VERSION_LEN: usize = 128;

/// Longest DNS subdomain accepted by the cluster API for most resource names.
pub const MAX_SUBDOMAIN_LEN: usize = 253;

/// Longest DNS label (service names, job names, host labels).
pub const MAX_LABEL_LEN: usize = 63;

/// Hex characters of the digest appended to names that lost information.
pub const NAME_DIGEST_LEN: usize = 8;

/// Archive formats recognized in the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveKind {
    /// Uncompressed tarball (`.tar`).
    Tar,
    /// Gzip-compressed tarball (`.tar.gz`).
    TarGz,
}

impl ArchiveKind {
    /// Returns the file extension, including the leading dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Tar => ".tar",
            Self::TarGz => ".tar.gz",
        }
    }

    /// Splits a file name into its stem and archive kind.
    ///
    /// `.tar.gz` is checked before `.tar`, so `v1.tar.gz` yields `("v1", TarGz)`.
    #[must_use]
    pub fn split_file_name(file_name: &str) -> Option<(&str, Self)> {
        [Self::TarGz, Self::Tar].into_iter().find_map(|kind| {
            file_name
                .strip_suffix(kind.extension())
                .map(|stem| (stem, kind))
        })
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tar => f.write_str("tar"),
            Self::TarGz => f.write_str("tar.gz"),
        }
    }
}

/// Reasons an object path does not name a deployable artifact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPath {
    /// The path does not have exactly one `/` separator.
    #[error("path '{path}' must have exactly one '/' separator (found {separators})")]
    Separators {
        /// The offending path.
        path: String,
        /// Number of separators found.
        separators: usize,
    },

    /// The file name does not end in a recognized archive extension.
    #[error("path '{path}' does not end in .tar or .tar.gz")]
    UnrecognizedExtension {
        /// The offending path.
        path: String,
    },

    /// The application name or version is empty.
    #[error("path '{path}' has an empty {segment}")]
    EmptySegment {
        /// The offending path.
        path: String,
        /// Which segment was empty.
        segment: &'static str,
    },

    /// The application name or version contains characters that are not
    /// legal in a resource name or image tag.
    #[error("path '{path}' has an illegal {segment} '{value}'")]
    IllegalCharacters {
        /// The offending path.
        path: String,
        /// Which segment was rejected.
        segment: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The version exceeds the image tag length limit.
    #[error("path '{path}' has a version longer than {MAX_VERSION_LEN} characters")]
    VersionTooLong {
        /// The offending path.
        path: String,
    },
}

impl InvalidPath {
    /// Returns the path that was rejected.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Separators { path, .. }
            | Self::UnrecognizedExtension { path }
            | Self::EmptySegment { path, .. }
            | Self::IllegalCharacters { path, .. }
            | Self::VersionTooLong { path } => path,
        }
    }
}

/// Ledger key of an artifact: one entry per `(application, version)`.
///
/// `widgets/v1.tar` and `widgets/v1.tar.gz` share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactKey {
    application_name: String,
    version: String,
}

impl ArtifactKey {
    /// Creates a key after validating both segments.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPath`] if either segment is empty or contains illegal characters.
    pub fn new(
        application_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self, InvalidPath> {
        let application_name = application_name.into();
        let version = version.into();
        let path = format!("{application_name}/{version}");
        validate_segment(&path, "application name", &application_name)?;
        validate_segment(&path, "version", &version)?;
        if version.len() > MAX_VERSION_LEN {
            return Err(InvalidPath::VersionTooLong { path });
        }
        Ok(Self {
            application_name,
            version,
        })
    }

    /// Returns the application name.
    #[must_use]
    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    /// Returns the version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application_name, self.version)
    }
}

/// A validated artifact discovered in the bucket. Immutable once derived.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "IdentityRepr")]
pub struct ArtifactIdentity {
    application_name: String,
    version: String,
    archive_kind: ArchiveKind,
    source_path: String,
}

impl ArtifactIdentity {
    /// Returns the application name.
    #[must_use]
    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    /// Returns the version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the archive format.
    #[must_use]
    pub const fn archive_kind(&self) -> ArchiveKind {
        self.archive_kind
    }

    /// Returns the object path this identity was derived from.
    #[must_use]
    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    /// Returns the ledger key for this artifact.
    #[must_use]
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey {
            application_name: self.application_name.clone(),
            version: self.version.clone(),
        }
    }

    /// Returns the image tag, `<application>:<version>`.
    #[must_use]
    pub fn image_tag(&self) -> String {
        format!("{}:{}", self.application_name, self.version)
    }

    /// Returns `<application>-<version>` sanitized for the given naming rule.
    ///
    /// Unique per identity: see [`distinct_resource_name`].
    #[must_use]
    pub fn resource_name(&self, kind: ResourceNameKind) -> String {
        distinct_resource_name(
            &format!("{}-{}", self.application_name, self.version),
            kind,
            kind.max_len(),
        )
    }
}

impl fmt::Display for ArtifactIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application_name, self.version)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRepr {
    application_name: String,
    version: String,
    archive_kind: ArchiveKind,
    source_path: String,
}

impl TryFrom<IdentityRepr> for ArtifactIdentity {
    type Error = String;

    fn try_from(repr: IdentityRepr) -> Result<Self, Self::Error> {
        let identity = identify(&repr.source_path).map_err(|e| e.to_string())?;
        if identity.application_name != repr.application_name
            || identity.version != repr.version
            || identity.archive_kind != repr.archive_kind
        {
            return Err(format!(
                "identity fields do not match source path '{}'",
                repr.source_path
            ));
        }
        Ok(identity)
    }
}

/// Derives an artifact identity from a bucket object path.
///
/// # Errors
///
/// Returns [`InvalidPath`] for paths with zero or more than one `/`, an unrecognized
/// extension, an empty application name or version, or illegal characters.
///
/// # Example
///
/// ```rust
/// use dockyard_core::artifact::{identify, ArchiveKind};
///
/// let identity = identify("widgets/v1.0.tar").unwrap();
/// assert_eq!(identity.application_name(), "widgets");
/// assert_eq!(identity.version(), "v1.0");
/// assert_eq!(identity.archive_kind(), ArchiveKind::Tar);
///
/// assert!(identify("widgets/v1.1.zip").is_err());
/// assert!(identify("v1.0.tar").is_err());
/// ```
pub fn identify(path: &str) -> Result<ArtifactIdentity, InvalidPath> {
    let separators = path.matches('/').count();
    if separators != 1 {
        return Err(InvalidPath::Separators {
            path: path.to_string(),
            separators,
        });
    }

    let (application_name, file_name) = path.split_once('/').ok_or_else(|| {
        InvalidPath::Separators {
            path: path.to_string(),
            separators,
        }
    })?;

    let (version, archive_kind) =
        ArchiveKind::split_file_name(file_name).ok_or_else(|| {
            InvalidPath::UnrecognizedExtension {
                path: path.to_string(),
            }
        })?;

    let key = ArtifactKey::new(application_name, version).map_err(|e| match e {
        InvalidPath::EmptySegment { segment, .. } => InvalidPath::EmptySegment {
            path: path.to_string(),
            segment,
        },
        InvalidPath::IllegalCharacters { segment, value, .. } => {
            InvalidPath::IllegalCharacters {
                path: path.to_string(),
                segment,
                value,
            }
        }
        InvalidPath::VersionTooLong { .. } => InvalidPath::VersionTooLong {
            path: path.to_string(),
        },
        other => other,
    })?;

    Ok(ArtifactIdentity {
        application_name: key.application_name,
        version: key.version,
        archive_kind,
        source_path: path.to_string(),
    })
}

fn validate_segment(path: &str, segment: &'static str, value: &str) -> Result<(), InvalidPath> {
    if value.is_empty() {
        return Err(InvalidPath::EmptySegment {
            path: path.to_string(),
            segment,
        });
    }

    let legal_chars = value
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.');
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = value.as_bytes();
    let alnum_edges = alnum(bytes[0]) && alnum(bytes[bytes.len() - 1]);

    if legal_chars && alnum_edges {
        Ok(())
    } else {
        Err(InvalidPath::IllegalCharacters {
            path: path.to_string(),
            segment,
            value: value.to_string(),
        })
    }
}

/// Naming rule a cluster resource must follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceNameKind {
    /// RFC 1123 subdomain: lowercase alphanumerics, `-` and `.`, up to 253 characters.
    /// Deployments and ingresses.
    Subdomain,
    /// RFC 1035 label: lowercase alphanumerics and `-`, up to 63 characters.
    /// Services and jobs.
    Label,
}

impl ResourceNameKind {
    /// Returns the longest name the rule accepts.
    #[must_use]
    pub const fn max_len(self) -> usize {
        match self {
            Self::Subdomain => MAX_SUBDOMAIN_LEN,
            Self::Label => MAX_LABEL_LEN,
        }
    }
}

/// Lowercases `raw`, replaces characters illegal for `kind` with `-`, trims
/// non-alphanumeric edges and truncates to the kind's length limit.
#[must_use]
pub fn sanitize_resource_name(raw: &str, kind: ResourceNameKind) -> String {
    let max_len = kind.max_len();
    let allow_dot = matches!(kind, ResourceNameKind::Subdomain);

    let mapped: String = raw
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            '.' if allow_dot => c,
            _ => '-',
        })
        .collect();

    let trimmed = mapped.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    let truncated: String = trimmed.chars().take(max_len).collect();
    truncated
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Sanitizes `raw` for `kind` within `max_len` characters (never more than the
/// kind's own limit).
///
/// A name that comes out different from `raw` ends in `-<digest>`, the first
/// [`NAME_DIGEST_LEN`] hex characters of the SHA-256 of `raw`. Two inputs that
/// sanitize to the same text therefore still get different names.
#[must_use]
pub fn distinct_resource_name(raw: &str, kind: ResourceNameKind, max_len: usize) -> String {
    let max_len = max_len.min(kind.max_len());
    let sanitized = sanitize_resource_name(raw, kind);
    if sanitized == raw && sanitized.len() <= max_len {
        return sanitized;
    }
    with_digest(&sanitized, raw, max_len)
}

/// Returns `raw` as a label value of at most [`MAX_LABEL_LEN`] characters.
///
/// `raw` must already consist of label-value characters, as identity segments do.
/// Longer values are cut and tagged like [`distinct_resource_name`].
#[must_use]
pub fn distinct_label_value(raw: &str) -> String {
    if raw.len() <= MAX_LABEL_LEN {
        return raw.to_string();
    }
    with_digest(raw, raw, MAX_LABEL_LEN)
}

fn name_digest(raw: &str) -> String {
    let mut digest = hex::encode(Sha256::digest(raw.as_bytes()));
    digest.truncate(NAME_DIGEST_LEN);
    digest
}

fn with_digest(base: &str, raw: &str, max_len: usize) -> String {
    let digest = name_digest(raw);
    let keep = max_len.saturating_sub(NAME_DIGEST_LEN + 1);
    let base: String = base.chars().take(keep).collect();
    let base = base.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    if base.is_empty() {
        digest
    } else {
        format!("{base}-{digest}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifies_tar_and_tar_gz() {
        let tar = identify("widgets/v1.0.tar").expect("valid");
        assert_eq!(tar.application_name(), "widgets");
        assert_eq!(tar.version(), "v1.0");
        assert_eq!(tar.archive_kind(), ArchiveKind::Tar);
        assert_eq!(tar.source_path(), "widgets/v1.0.tar");

        let gz = identify("widgets/v1.0.tar.gz").expect("valid");
        assert_eq!(gz.version(), "v1.0");
        assert_eq!(gz.archive_kind(), ArchiveKind::TarGz);
        assert_eq!(tar.key(), gz.key());
    }

    #[test]
    fn rejects_separator_counts() {
        assert!(matches!(
            identify("v1.0.tar"),
            Err(InvalidPath::Separators { separators: 0, .. })
        ));
        assert!(matches!(
            identify("team/widgets/v1.0.tar"),
            Err(InvalidPath::Separators { separators: 2, .. })
        ));
        assert!(matches!(
            identify("/widgets/v1.0.tar"),
            Err(InvalidPath::Separators { separators: 2, .. })
        ));
    }

    #[test]
    fn rejects_unrecognized_extensions() {
        for path in ["widgets/v1.1.zip", "widgets/v1.1.tgz", "widgets/v1.1", "widgets/"] {
            assert!(
                matches!(identify(path), Err(InvalidPath::UnrecognizedExtension { .. })),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(matches!(
            identify("/v1.tar"),
            Err(InvalidPath::EmptySegment {
                segment: "application name",
                ..
            })
        ));
        assert!(matches!(
            identify("widgets/.tar.gz"),
            Err(InvalidPath::EmptySegment {
                segment: "version",
                ..
            })
        ));
    }

    #[test]
    fn rejects_illegal_characters() {
        for path in [
            "Widgets/v1.tar",
            "widgets/V1.tar",
            "wid_gets/v1.tar",
            "widgets/v1 beta.tar",
            "-widgets/v1.tar",
            "widgets/v1-.tar",
            "widgets/.v1.tar",
        ] {
            let err = identify(path).expect_err(path);
            assert!(
                matches!(err, InvalidPath::IllegalCharacters { .. }),
                "{path}: {err}"
            );
            assert_eq!(err.path(), path);
        }
    }

    #[test]
    fn rejects_overlong_version() {
        let path = format!("widgets/{}.tar", "a".repeat(MAX_VERSION_LEN + 1));
        assert!(matches!(
            identify(&path),
            Err(InvalidPath::VersionTooLong { .. })
        ));
    }

    #[test]
    fn image_tag_and_resource_names() {
        let identity = identify("widgets/v1.0.tar").expect("valid");
        assert_eq!(identity.image_tag(), "widgets:v1.0");
        assert_eq!(
            identity.resource_name(ResourceNameKind::Subdomain),
            "widgets-v1.0"
        );
        let label = identity.resource_name(ResourceNameKind::Label);
        assert!(label.starts_with("widgets-v1-0-"), "{label}");
        assert_eq!(label.len(), "widgets-v1-0-".len() + NAME_DIGEST_LEN);

        let dashed = identify("widgets/v1-0.tar").expect("valid");
        assert_eq!(dashed.resource_name(ResourceNameKind::Label), "widgets-v1-0");
    }

    #[test]
    fn versions_differing_only_in_dots_get_distinct_labels() {
        let dotted = identify("widgets/v1.0.tar").expect("valid");
        let dashed = identify("widgets/v1-0.tar").expect("valid");
        assert_ne!(
            dotted.resource_name(ResourceNameKind::Label),
            dashed.resource_name(ResourceNameKind::Label)
        );
        assert_eq!(
            dotted.resource_name(ResourceNameKind::Label),
            dotted.resource_name(ResourceNameKind::Label)
        );
    }

    #[test]
    fn truncated_names_and_label_values_keep_their_tail() {
        let shared = "1".repeat(80);
        let a = format!("v{shared}a");
        let b = format!("v{shared}b");

        let value_a = distinct_label_value(&a);
        let value_b = distinct_label_value(&b);
        assert_ne!(value_a, value_b);
        assert!(value_a.len() <= MAX_LABEL_LEN);
        assert_eq!(distinct_label_value("v1.0"), "v1.0");

        let name_a = distinct_resource_name(&format!("widgets-{a}"), ResourceNameKind::Label, 40);
        let name_b = distinct_resource_name(&format!("widgets-{b}"), ResourceNameKind::Label, 40);
        assert_ne!(name_a, name_b);
        assert!(name_a.len() <= 40);
        assert!(name_a.bytes().last().is_some_and(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn sanitize_trims_and_truncates() {
        assert_eq!(
            sanitize_resource_name("--Build_Widgets--", ResourceNameKind::Label),
            "build-widgets"
        );
        let long = format!("{}-tail", "a".repeat(70));
        let label = sanitize_resource_name(&long, ResourceNameKind::Label);
        assert_eq!(label.len(), MAX_LABEL_LEN);

        // Truncation that lands on a dash trims it.
        let dashy = format!("{}-b", "a".repeat(MAX_LABEL_LEN - 1));
        let label = sanitize_resource_name(&dashy, ResourceNameKind::Label);
        assert_eq!(label, "a".repeat(MAX_LABEL_LEN - 1));
    }

    #[test]
    fn identity_serde_revalidates() {
        let identity = identify("widgets/v2.0.tar.gz").expect("valid");
        let json = serde_json::to_string(&identity).expect("serialize");
        assert!(json.contains("\"archiveKind\":\"TAR_GZ\""));
        let parsed: ArtifactIdentity = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, identity);

        let tampered = json.replace("\"version\":\"v2.0\"", "\"version\":\"v3.0\"");
        assert!(serde_json::from_str::<ArtifactIdentity>(&tampered).is_err());
    }

    #[test]
    fn key_display() {
        let key = ArtifactKey::new("widgets", "v1.0").expect("valid");
        assert_eq!(key.to_string(), "widgets/v1.0");
        assert!(ArtifactKey::new("widgets", "").is_err());
    }
}
