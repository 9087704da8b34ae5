//! Build descriptor lookup inside a source archive.
//!
//! The build context is the directory holding the `Dockerfile`. A descriptor at
//! the archive root wins; otherwise the shallowest one found is used, ties
//! broken by path. Matching ignores case.

use std::io::Read;
use std::path::{Component, Path};

use flate2::read::GzDecoder;

use dockyard_core::ArchiveKind;

use super::BuildFailure;

/// Canonical build descriptor file name.
pub const DESCRIPTOR_NAME: &str = "Dockerfile";

/// Where the descriptor sits inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorLocation {
    /// Directory relative to the archive root, or `None` for the root itself.
    pub sub_path: Option<String>,
    /// File name as stored in the archive.
    pub file_name: String,
}

/// Finds the build descriptor in `archive`.
///
/// # Errors
///
/// Returns [`BuildFailure`] if the archive cannot be read or contains no descriptor.
pub fn find_descriptor(archive: &[u8], kind: ArchiveKind) -> Result<DescriptorLocation, BuildFailure> {
    match kind {
        ArchiveKind::Tar => scan(archive),
        ArchiveKind::TarGz => scan(GzDecoder::new(archive)),
    }
}

fn scan<R: Read>(reader: R) -> Result<DescriptorLocation, BuildFailure> {
    let unreadable = |e: std::io::Error| BuildFailure::new(format!("unreadable archive: {e}"));

    let mut archive = tar::Archive::new(reader);
    let mut best: Option<(usize, Vec<String>, String)> = None;

    for entry in archive.entries().map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(unreadable)?;
        let Some((dirs, file_name)) = split_normal(&path) else {
            continue;
        };
        if !file_name.eq_ignore_ascii_case(DESCRIPTOR_NAME) {
            continue;
        }

        let candidate = (dirs.len(), dirs, file_name);
        let better = best.as_ref().map_or(true, |current| {
            (candidate.0, &candidate.1) < (current.0, &current.1)
        });
        if better {
            best = Some(candidate);
        }
    }

    let (_, dirs, file_name) = best.ok_or_else(|| {
        BuildFailure::new(format!("archive contains no {DESCRIPTOR_NAME}"))
    })?;
    Ok(DescriptorLocation {
        sub_path: (!dirs.is_empty()).then(|| dirs.join("/")),
        file_name,
    })
}

/// Splits an entry path into its directories and file name, ignoring `./`
/// prefixes. Paths escaping the root are rejected.
fn split_normal(path: &Path) -> Option<(Vec<String>, String)> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    let file_name = parts.pop()?;
    Some((parts, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn tarball(files: &[&str]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for path in files {
            let body = b"FROM scratch\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, path, &body[..])
                .expect("append");
        }
        builder.into_inner().expect("finish")
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).expect("write");
        encoder.finish().expect("finish")
    }

    #[test]
    fn root_descriptor_wins() {
        let archive = tarball(&["app/Dockerfile", "Dockerfile", "main.go"]);
        let found = find_descriptor(&archive, ArchiveKind::Tar).expect("found");
        assert_eq!(found.sub_path, None);
        assert_eq!(found.file_name, "Dockerfile");
    }

    #[test]
    fn shallowest_nested_descriptor_sets_sub_path() {
        let archive = tarball(&["./src/deep/Dockerfile", "./src/Dockerfile", "./README.md"]);
        let found = find_descriptor(&gzip(&archive), ArchiveKind::TarGz).expect("found");
        assert_eq!(found.sub_path.as_deref(), Some("src"));
    }

    #[test]
    fn match_is_case_insensitive() {
        let archive = tarball(&["dockerfile"]);
        let found = find_descriptor(&archive, ArchiveKind::Tar).expect("found");
        assert_eq!(found.file_name, "dockerfile");
    }

    #[test]
    fn missing_descriptor_is_a_failure() {
        let archive = tarball(&["main.py", "Dockerfile.dev"]);
        let failure = find_descriptor(&archive, ArchiveKind::Tar).expect_err("none");
        assert!(failure.reason.contains("no Dockerfile"));
    }

    #[test]
    fn wrong_compression_is_unreadable() {
        let archive = tarball(&["Dockerfile"]);
        let failure = find_descriptor(&archive, ArchiveKind::TarGz).expect_err("not gzip");
        assert!(failure.reason.contains("unreadable archive"));
    }
}
