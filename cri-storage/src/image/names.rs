//! Splitting and deriving the names an image is listed under.

use std::collections::BTreeSet;

use references::{Digest, ImageName};
use store::ImageRecord;

/// `@sha256:` followed by 64 hex characters.
const SHA256_SUFFIX_LEN: usize = 72;
const SHA256_ENCODED_LEN: usize = 64;

/// Names split into tagged and digested ones, both sorted.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SortedNames {
    /// The name to show when only one fits: the first tag in storage order,
    /// else the first digested name.
    pub(crate) best: Option<String>,
    pub(crate) tags: Vec<String>,
    pub(crate) digests: Vec<String>,
}

pub(crate) fn sort_names_by_type(names: &[String]) -> SortedNames {
    let mut sorted = SortedNames::default();
    for name in names {
        let len = name.len();
        let digested = len > SHA256_SUFFIX_LEN
            && name.get(len - SHA256_SUFFIX_LEN..len - SHA256_ENCODED_LEN) == Some("@sha256:");
        if digested {
            sorted.digests.push(name.clone());
        } else {
            sorted.tags.push(name.clone());
        }
    }

    sorted.best = sorted
        .tags
        .first()
        .or_else(|| sorted.digests.first())
        .cloned();
    sorted.tags.sort();
    sorted.digests.sort();
    sorted
}

/// The manifest digests an image is known by, primary first.
pub(crate) fn image_digests(record: &ImageRecord) -> Vec<Digest> {
    let primary = record.digest.as_ref().or_else(|| {
        record
            .big_data_digests
            .get(store::IMAGE_DIGEST_BIG_DATA_KEY)
    });

    let mut digests: Vec<Digest> = Vec::new();
    for candidate in primary.into_iter().chain(&record.digests) {
        match candidate.parse::<Digest>() {
            Ok(digest) if !digests.contains(&digest) => digests.push(digest),
            Ok(_) => {}
            Err(error) => tracing::debug!(image = %record.id, "ignoring stored digest: {error}"),
        }
    }
    digests
}

/// Supplement `known` with `repository@digest` for every tagged name and
/// every manifest digest of the image.
///
/// Returns the image's primary digest and the sorted, deduplicated list.
pub(crate) fn make_repo_digests(
    known: &[String],
    tags: &[String],
    record: &ImageRecord,
) -> (Option<Digest>, Vec<String>) {
    let digests = image_digests(record);
    let mut repo_digests: BTreeSet<String> = known.iter().cloned().collect();

    for tag in tags {
        let Ok(name) = ImageName::parse(tag) else {
            continue;
        };
        let repository = name.repository_name();
        for digest in &digests {
            repo_digests.insert(format!("{repository}@{digest}"));
        }
    }

    (digests.into_iter().next(), repo_digests.into_iter().collect())
}

/// True if any of `names` is matched by a pin pattern. A pattern ending in
/// `*` matches by prefix.
pub(crate) fn matches_pinned(patterns: &[String], names: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        names.iter().any(|name| match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pattern,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn splits_tags_from_digests() {
        let digest = Digest::sha256(b"manifest");
        let digested = format!("quay.io/a/b@{digest}");
        let names = strings(&["quay.io/a/b:v2", &digested, "quay.io/a/b:v1"]);

        let sorted = sort_names_by_type(&names);
        assert_eq!(sorted.best.as_deref(), Some("quay.io/a/b:v2"));
        assert_eq!(sorted.tags, strings(&["quay.io/a/b:v1", "quay.io/a/b:v2"]));
        assert_eq!(sorted.digests, vec![digested.clone()]);

        let only_digest = sort_names_by_type(std::slice::from_ref(&digested));
        assert_eq!(only_digest.best, Some(digested));
        assert_eq!(sort_names_by_type(&[]), SortedNames::default());
    }

    #[test]
    fn short_names_are_tags() {
        let sorted = sort_names_by_type(&strings(&["x", "@sha256:"]));
        assert_eq!(sorted.tags.len(), 2);
        assert!(sorted.digests.is_empty());
    }

    #[test]
    fn repo_digests_are_idempotent() {
        let primary = Digest::sha256(b"primary");
        let other = Digest::sha256(b"other");
        let mut record = ImageRecord::new("id");
        record.digest = Some(primary.to_string());
        record.digests = vec![other.to_string(), primary.to_string()];

        let tags = strings(&["quay.io/a/b:v1", "docker.io/library/busybox:latest"]);
        let (digest, first) = make_repo_digests(&[], &tags, &record);
        assert_eq!(digest, Some(primary.clone()));
        assert_eq!(first.len(), 4);
        assert!(first.contains(&format!("quay.io/a/b@{primary}")));
        assert!(first.contains(&format!("docker.io/library/busybox@{other}")));

        let (_, second) = make_repo_digests(&first, &tags, &record);
        assert_eq!(first, second);

        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(first, sorted);
    }

    #[test]
    fn repo_digests_fall_back_to_manifest_big_data() {
        let manifest = Digest::sha256(b"manifest");
        let mut record = ImageRecord::new("id");
        record
            .big_data_digests
            .insert("manifest".into(), manifest.to_string());

        let (digest, repo_digests) =
            make_repo_digests(&[], &strings(&["quay.io/a/b:v1"]), &record);
        assert_eq!(digest, Some(manifest.clone()));
        assert_eq!(repo_digests, vec![format!("quay.io/a/b@{manifest}")]);

        let (digest, repo_digests) =
            make_repo_digests(&strings(&["kept"]), &[], &ImageRecord::new("bare"));
        assert_eq!(digest, None);
        assert_eq!(repo_digests, strings(&["kept"]));
    }

    #[test]
    fn pin_patterns() {
        let patterns = strings(&["registry.k8s.io/pause:3.10", "quay.io/infra/*"]);
        assert!(matches_pinned(&patterns, &strings(&["registry.k8s.io/pause:3.10"])));
        assert!(matches_pinned(&patterns, &strings(&["x", "quay.io/infra/agent:v1"])));
        assert!(!matches_pinned(&patterns, &strings(&["registry.k8s.io/pause:3.9"])));
        assert!(!matches_pinned(&[], &strings(&["anything"])));
    }
}
