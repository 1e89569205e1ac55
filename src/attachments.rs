//! Attachment import with content-addressed dedup.
//!
//! When the destination post already exists, a candidate attachment is only
//! uploaded if no currently attached file matches it by name, size and
//! content. Content identity is decided by hashing both streams, never by
//! trusting metadata, so re-importing byte-identical content is idempotent:
//! exactly one stored file results.

use crate::archive::{AttachmentSource, ImportArchive};
use crate::error::ImportError;
use crate::model::AttachmentData;
use crate::store::{FileRecord, FileStore, PostRecord, Store};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use uuid::Uuid;

const COMPARE_CHUNK_BYTES: usize = 64 * 1024;

/// Import one attachment for a post, reusing an already-attached file when
/// its bytes are identical. Returns the file row the post should reference.
pub(crate) fn import_attachment(
    store: &dyn Store,
    files: &dyn FileStore,
    archive: Option<&ImportArchive>,
    attachment: &AttachmentData,
    post: &PostRecord,
    team_id: &str,
) -> Result<FileRecord, ImportError> {
    let name = base_name(&attachment.path);
    let size = source_size(attachment)?;

    // Scan the post's current files for a (name, size) candidate; content
    // decides whether the existing row can be reused.
    if post.is_saved() {
        for old in store.files_for_post(&post.id)? {
            if old.name != name || old.size != size as i64 {
                continue;
            }
            let mut old_reader = files.open(&old.path)?;
            let equal = with_source_reader(attachment, archive, |new_reader| {
                compare_streams(old_reader.as_mut(), new_reader)
            })?;
            if equal {
                log::info!(
                    "skipping upload of {}: file with identical content already attached",
                    name
                );
                return Ok(old);
            }
            log::info!("contents of {} changed, re-uploading", name);
            break;
        }
    }

    // The compare pass consumed the source; reopen it for upload. ZIP entry
    // readers cannot seek, filesystem paths are simply opened again.
    let file_id = Uuid::new_v4().simple().to_string();
    let blob_path = format!("{}/{}/{}/{}", team_id, post.channel_id, file_id, name);
    let written = with_source_reader(attachment, archive, |reader| {
        files
            .store(&blob_path, reader)
            .map_err(std::io::Error::other)
    })?;

    let record = store.save_file(FileRecord {
        id: file_id,
        name,
        size: written as i64,
        path: blob_path,
        post_id: post.id.clone(),
        channel_id: post.channel_id.clone(),
        user_id: post.user_id.clone(),
        team_id: team_id.to_string(),
        create_at: post.create_at,
    })?;
    log::info!("uploaded attachment {} ({} bytes)", record.name, written);
    Ok(record)
}

/// Copy a resolved source into the blob backend at `dest`. Used for profile
/// and emoji images, which have no per-post file row.
pub(crate) fn store_source(
    files: &dyn FileStore,
    archive: Option<&ImportArchive>,
    attachment: &AttachmentData,
    dest: &str,
) -> Result<u64, ImportError> {
    with_source_reader(attachment, archive, |reader| {
        files.store(dest, reader).map_err(std::io::Error::other)
    })
}

/// Uncompressed byte size of a resolved source, without reading it.
pub(crate) fn source_size(attachment: &AttachmentData) -> Result<u64, ImportError> {
    match &attachment.source {
        Some(AttachmentSource::File(path)) => Ok(std::fs::metadata(path)
            .map_err(|err| unreadable(&attachment.path, err))?
            .len()),
        Some(AttachmentSource::Archive { size, .. }) => Ok(*size),
        Some(AttachmentSource::Missing { name }) => Err(ImportError::Attachment {
            path: name.clone(),
            reason: "not found in archive".into(),
        }),
        None => Err(ImportError::Attachment {
            path: attachment.path.clone(),
            reason: "attachment was never resolved".into(),
        }),
    }
}

/// Run `f` over a fresh reader for the attachment's bytes. The reader is
/// scoped to the closure and released on every exit path.
fn with_source_reader<T>(
    attachment: &AttachmentData,
    archive: Option<&ImportArchive>,
    f: impl FnOnce(&mut dyn Read) -> std::io::Result<T>,
) -> Result<T, ImportError> {
    match &attachment.source {
        Some(AttachmentSource::File(path)) => {
            let mut file = std::fs::File::open(path)
                .map_err(|err| unreadable(&path.to_string_lossy(), err))?;
            f(&mut file).map_err(|err| unreadable(&path.to_string_lossy(), err))
        }
        Some(AttachmentSource::Archive { name, .. }) => match archive {
            Some(archive) => archive.with_entry(name, f).map_err(|err| {
                ImportError::Attachment {
                    path: name.clone(),
                    reason: err.to_string(),
                }
            }),
            None => Err(ImportError::Attachment {
                path: name.clone(),
                reason: "archive entry referenced but no archive supplied".into(),
            }),
        },
        Some(AttachmentSource::Missing { name }) => Err(ImportError::Attachment {
            path: name.clone(),
            reason: "not found in archive".into(),
        }),
        None => Err(ImportError::Attachment {
            path: attachment.path.clone(),
            reason: "attachment was never resolved".into(),
        }),
    }
}

fn unreadable(path: &str, err: std::io::Error) -> ImportError {
    ImportError::Attachment {
        path: path.to_string(),
        reason: err.to_string(),
    }
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Decide whether two streams hold identical bytes by hashing both with
/// SHA-256 while counting lengths. A length mismatch short-circuits as
/// "different" without finishing either digest.
pub(crate) fn compare_streams(a: &mut dyn Read, b: &mut dyn Read) -> std::io::Result<bool> {
    let mut hash_a = Sha256::new();
    let mut hash_b = Sha256::new();
    let mut buf_a = vec![0u8; COMPARE_CHUNK_BYTES];
    let mut buf_b = vec![0u8; COMPARE_CHUNK_BYTES];

    loop {
        let n_a = read_full(a, &mut buf_a)?;
        let n_b = read_full(b, &mut buf_b)?;
        if n_a != n_b {
            return Ok(false);
        }
        if n_a == 0 {
            break;
        }
        hash_a.update(&buf_a[..n_a]);
        hash_b.update(&buf_b[..n_b]);
    }

    Ok(hash_a.finalize() == hash_b.finalize())
}

/// Fill as much of `buf` as possible; a short return means end of stream.
fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryFileStore, MemoryStore};
    use std::io::Cursor;
    use std::path::PathBuf;

    fn file_attachment(dir: &Path, name: &str, content: &[u8]) -> AttachmentData {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        AttachmentData {
            path: name.to_string(),
            source: Some(AttachmentSource::File(path)),
        }
    }

    #[test]
    fn identical_streams_compare_equal() {
        let mut a = Cursor::new(vec![7u8; 200_000]);
        let mut b = Cursor::new(vec![7u8; 200_000]);
        assert!(compare_streams(&mut a, &mut b).unwrap());
    }

    #[test]
    fn length_mismatch_short_circuits() {
        let mut a = Cursor::new(vec![7u8; 100]);
        let mut b = Cursor::new(vec![7u8; 101]);
        assert!(!compare_streams(&mut a, &mut b).unwrap());
    }

    #[test]
    fn same_length_different_content_compares_unequal() {
        let mut a = Cursor::new(vec![7u8; 100]);
        let mut b = Cursor::new(vec![8u8; 100]);
        assert!(!compare_streams(&mut a, &mut b).unwrap());
    }

    #[test]
    fn reimporting_identical_content_reuses_the_file_row() {
        let store = MemoryStore::new();
        let files = MemoryFileStore::new();
        let dir = tempfile::tempdir().unwrap();
        let attachment = file_attachment(dir.path(), "doc.txt", b"same bytes");

        let mut post = PostRecord {
            channel_id: "c1".into(),
            user_id: "u1".into(),
            message: "m".into(),
            create_at: 100,
            ..Default::default()
        };

        let first = import_attachment(&store, &files, None, &attachment, &post, "t1").unwrap();
        post.id = "p1".into();
        store.attach_file_to_post(&first.id, &post.id).unwrap();

        let second = import_attachment(&store, &files, None, &attachment, &post, "t1").unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(store.files_for_post("p1").unwrap().len(), 1);
        assert_eq!(files.blob_count(), 1);
    }

    #[test]
    fn changed_content_with_same_name_and_size_uploads_again() {
        let store = MemoryStore::new();
        let files = MemoryFileStore::new();
        let dir = tempfile::tempdir().unwrap();

        let mut post = PostRecord {
            channel_id: "c1".into(),
            user_id: "u1".into(),
            message: "m".into(),
            create_at: 100,
            ..Default::default()
        };

        let original = file_attachment(dir.path(), "doc.txt", b"version A!");
        let first = import_attachment(&store, &files, None, &original, &post, "t1").unwrap();
        post.id = "p1".into();
        store.attach_file_to_post(&first.id, &post.id).unwrap();

        // Same name, same size, different bytes.
        let changed = file_attachment(dir.path(), "doc.txt", b"version B!");
        let second = import_attachment(&store, &files, None, &changed, &post, "t1").unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(files.blob_count(), 2);
    }

    #[test]
    fn missing_archive_entry_fails_only_this_attachment() {
        let store = MemoryStore::new();
        let files = MemoryFileStore::new();
        let attachment = AttachmentData {
            path: "gone.txt".into(),
            source: Some(AttachmentSource::Missing {
                name: "export/gone.txt".into(),
            }),
        };
        let post = PostRecord::default();
        let err = import_attachment(&store, &files, None, &attachment, &post, "t1").unwrap_err();
        assert!(matches!(err, ImportError::Attachment { .. }));
    }

    #[test]
    fn unreadable_filesystem_source_is_an_attachment_error() {
        let store = MemoryStore::new();
        let files = MemoryFileStore::new();
        let attachment = AttachmentData {
            path: "nope.bin".into(),
            source: Some(AttachmentSource::File(PathBuf::from(
                "/definitely/not/here.bin",
            ))),
        };
        let post = PostRecord::default();
        let err = import_attachment(&store, &files, None, &attachment, &post, "t1").unwrap_err();
        assert!(matches!(err, ImportError::Attachment { .. }));
    }
}
