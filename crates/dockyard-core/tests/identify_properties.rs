//! Property-based tests for artifact identification.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;

use dockyard_core::artifact::{sanitize_resource_name, MAX_LABEL_LEN};
use dockyard_core::{identify, ArchiveKind, ResourceNameKind};

/// Generates a legal application name or version segment.
fn arb_segment() -> impl Strategy<Value = String> {
    "[a-z0-9]([a-z0-9.-]{0,20}[a-z0-9])?"
}

fn arb_kind() -> impl Strategy<Value = ArchiveKind> {
    prop::sample::select(vec![ArchiveKind::Tar, ArchiveKind::TarGz])
}

proptest! {
    #[test]
    fn well_formed_paths_are_identified((app, version, kind) in (arb_segment(), arb_segment(), arb_kind())) {
        let path = format!("{app}/{version}{}", kind.extension());
        let identity = identify(&path).expect("well-formed path should identify");
        prop_assert_eq!(identity.application_name(), app.as_str());
        prop_assert_eq!(identity.version(), version.as_str());
        prop_assert_eq!(identity.archive_kind(), kind);
        prop_assert_eq!(identity.source_path(), path.as_str());
    }

    #[test]
    fn extra_separators_are_rejected((a, b, c) in (arb_segment(), arb_segment(), arb_segment())) {
        let path = format!("{a}/{b}/{c}.tar");
        prop_assert!(identify(&path).is_err());
    }

    #[test]
    fn identify_never_panics(path in "\\PC{0,64}") {
        let _ = identify(&path);
    }

    #[test]
    fn tar_and_tar_gz_share_a_key((app, version) in (arb_segment(), arb_segment())) {
        let tar = identify(&format!("{app}/{version}.tar")).expect("tar");
        let gz = identify(&format!("{app}/{version}.tar.gz")).expect("tar.gz");
        prop_assert_eq!(tar.key(), gz.key());
    }

    #[test]
    fn label_names_are_dns_labels(raw in "\\PC{0,100}") {
        let name = sanitize_resource_name(&raw, ResourceNameKind::Label);
        prop_assert!(name.len() <= MAX_LABEL_LEN);
        prop_assert!(name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-'));
        if let (Some(first), Some(last)) = (name.bytes().next(), name.bytes().last()) {
            prop_assert!(first.is_ascii_alphanumeric());
            prop_assert!(last.is_ascii_alphanumeric());
        }
    }

    #[test]
    fn distinct_identities_get_distinct_label_names(
        (app, v1, v2) in (arb_segment(), arb_segment(), arb_segment())
    ) {
        prop_assume!(v1 != v2);
        let a = identify(&format!("{app}/{v1}.tar")).expect("first");
        let b = identify(&format!("{app}/{v2}.tar")).expect("second");
        let name_a = a.resource_name(ResourceNameKind::Label);
        let name_b = b.resource_name(ResourceNameKind::Label);
        prop_assert_ne!(&name_a, &name_b);
        prop_assert!(name_a.len() <= MAX_LABEL_LEN);
    }
}
