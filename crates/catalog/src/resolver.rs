//! Conflict resolution for remote-wins imports.

use lightbox_core::digest::ContentDigest;
use lightbox_core::entry::CatalogEntry;
use std::collections::BTreeMap;

/// Merge a downloaded shard into the local entry set.
///
/// The remote is authoritative for the synced fields and for which digests
/// exist at all: entries absent from the remote are dropped, entries only in
/// the remote appear with default local fields. Local-only fields survive for
/// every digest present on both sides.
pub fn resolve_import(
    remote: Vec<CatalogEntry>,
    local: &BTreeMap<ContentDigest, CatalogEntry>,
) -> BTreeMap<ContentDigest, CatalogEntry> {
    let mut merged = BTreeMap::new();
    for mut entry in remote {
        if let Some(existing) = local.get(&entry.digest) {
            entry.local = existing.local;
        }
        merged.insert(entry.digest, entry);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use lightbox_core::entry::{BackupStatus, LocalFields};
    use time::OffsetDateTime;

    fn entry(seed: &[u8], filename: &str) -> CatalogEntry {
        CatalogEntry {
            digest: ContentDigest::compute(seed),
            filename: filename.to_string(),
            file_size: 100,
            photo_date: OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap(),
            modified_date: OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap(),
            width: None,
            height: None,
            source_id: None,
            local: LocalFields::default(),
        }
    }

    fn as_map(entries: Vec<CatalogEntry>) -> BTreeMap<ContentDigest, CatalogEntry> {
        entries.into_iter().map(|e| (e.digest, e)).collect()
    }

    #[test]
    fn test_local_fields_survive_shared_digests() {
        let mut local_a = entry(b"a", "a.jpg");
        local_a.local.starred = true;
        local_a.local.backup_status = BackupStatus::Uploaded;
        let local = as_map(vec![local_a.clone(), entry(b"b", "b.jpg")]);

        // Remote kept A (renamed), dropped B, added C.
        let mut remote_a = entry(b"a", "renamed.jpg");
        remote_a.local = LocalFields::default();
        let remote_c = entry(b"c", "c.jpg");

        let merged = resolve_import(vec![remote_a.clone(), remote_c.clone()], &local);

        assert_eq!(merged.len(), 2);
        let a = &merged[&local_a.digest];
        assert_eq!(a.filename, "renamed.jpg"); // remote wins on synced fields
        assert!(a.local.starred); // local fields carried forward
        assert_eq!(a.local.backup_status, BackupStatus::Uploaded);

        assert!(!merged.contains_key(&entry(b"b", "b.jpg").digest));
        assert_eq!(merged[&remote_c.digest].local, LocalFields::default());
    }

    #[test]
    fn test_empty_remote_empties_shard() {
        let local = as_map(vec![entry(b"a", "a.jpg")]);
        assert!(resolve_import(Vec::new(), &local).is_empty());
    }
}
