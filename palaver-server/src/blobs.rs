//! Filesystem blob store for uploaded images.
//!
//! Blobs are stored as flat files in the uploads directory and
//! addressed by refs of the form `/uploads/<millis>-<name>`, which
//! double as the URL path the static file layer serves them under.

use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// URL prefix every blob ref starts with.
pub const REF_PREFIX: &str = "/uploads/";

pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open the store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// Save bytes under a timestamped name derived from the original
    /// filename, returning the blob ref.
    pub fn save(&self, bytes: &[u8], original_name: &str) -> io::Result<String> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let name = sanitize_filename(original_name);
        let filename = format!("{millis}-{name}");
        std::fs::write(self.dir.join(&filename), bytes)?;
        Ok(format!("{REF_PREFIX}{filename}"))
    }

    /// Delete the blob behind a ref. Refs that don't look like ours
    /// (wrong prefix, path separators) are rejected rather than
    /// resolved against the filesystem.
    pub fn delete(&self, blob_ref: &str) -> io::Result<()> {
        let filename = blob_ref
            .strip_prefix(REF_PREFIX)
            .filter(|f| !f.is_empty() && !f.contains('/') && !f.contains('\\'))
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("bad blob ref: {blob_ref}"))
            })?;
        std::fs::remove_file(self.dir.join(filename))
    }
}

/// Keep only characters that are safe in a flat filename.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_delete_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(tmp.path().join("uploads")).unwrap();

        let blob_ref = store.save(b"png bytes", "cat.png").unwrap();
        assert!(blob_ref.starts_with(REF_PREFIX));
        assert!(blob_ref.ends_with("-cat.png"));

        let on_disk = store.dir().join(blob_ref.strip_prefix(REF_PREFIX).unwrap());
        assert_eq!(std::fs::read(&on_disk).unwrap(), b"png bytes");

        store.delete(&blob_ref).unwrap();
        assert!(!on_disk.exists());
    }

    #[test]
    fn hostile_names_are_flattened() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(tmp.path().join("uploads")).unwrap();

        let blob_ref = store.save(b"x", "../../etc/passwd").unwrap();
        assert!(!blob_ref.strip_prefix(REF_PREFIX).unwrap().contains('/'));
        // The file landed inside the store, not outside it.
        let entries = std::fs::read_dir(store.dir()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn delete_rejects_traversal_refs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::open(tmp.path().join("uploads")).unwrap();
        assert!(store.delete("/uploads/../secret").is_err());
        assert!(store.delete("/elsewhere/file.png").is_err());
        assert!(store.delete("/uploads/").is_err());
    }
}
