//! Attachment sources and the import archive.
//!
//! Attachment-bearing payload fields carry paths relative to the export. The
//! resolver joins them with the caller-supplied base path and, when a ZIP
//! archive accompanies the manifest, binds them to entries in the archive's
//! name index. A path the archive does not contain is not fatal here: the
//! record proceeds and only that attachment fails later, with a warning.

use crate::model::{AttachmentData, ImportLine};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to open archive: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("archive has no entry named {0}")]
    EntryMissing(String),
}

/// Where an attachment's bytes live once the resolver has run.
#[derive(Debug, Clone)]
pub enum AttachmentSource {
    /// Resolved against the filesystem; opened lazily.
    File(PathBuf),
    /// Bound to an archive entry. ZIP entry readers cannot seek, so a second
    /// pass over the bytes reopens the entry.
    Archive { name: String, size: u64 },
    /// An archive was supplied but contains no such entry. Importing this
    /// attachment fails with a warn-and-skip.
    Missing { name: String },
}

trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// A random-access named-blob archive backing attachment fields.
///
/// The underlying ZIP reader yields one entry at a time, so entry access is
/// serialized behind a mutex and exposed through a closure: the reader is
/// released on every exit path.
pub struct ImportArchive {
    inner: Mutex<ZipArchive<Box<dyn ReadSeek>>>,
    sizes: HashMap<String, u64>,
}

impl ImportArchive {
    pub fn new<R>(reader: R) -> Result<Self, ArchiveError>
    where
        R: Read + Seek + Send + 'static,
    {
        let boxed: Box<dyn ReadSeek> = Box::new(reader);
        let mut archive = ZipArchive::new(boxed)?;
        let mut sizes = HashMap::with_capacity(archive.len());
        for i in 0..archive.len() {
            let entry = archive.by_index(i)?;
            sizes.insert(entry.name().to_string(), entry.size());
        }
        Ok(Self {
            inner: Mutex::new(archive),
            sizes,
        })
    }

    pub fn open_path(path: &Path) -> Result<Self, ArchiveError> {
        Self::new(File::open(path)?)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sizes.contains_key(name)
    }

    /// Uncompressed size of an entry, from the archive's central directory.
    pub fn entry_size(&self, name: &str) -> Option<u64> {
        self.sizes.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Run `f` over a fresh reader for the named entry.
    pub fn with_entry<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut dyn Read) -> std::io::Result<T>,
    ) -> Result<T, ArchiveError> {
        let mut archive = self.inner.lock();
        let mut entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(ArchiveError::EntryMissing(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(f(&mut entry)?)
    }
}

/// Rewrite every attachment-bearing field of a decoded line, joining the
/// stored relative path with `base_path` and binding it to `archive` when one
/// was supplied.
pub fn resolve_attachments(
    line: &mut ImportLine,
    base_path: &Path,
    archive: Option<&ImportArchive>,
) {
    match line {
        ImportLine::Post { post: Some(post) } => {
            for attachment in &mut post.attachments {
                resolve_one(attachment, base_path, archive);
            }
            for reply in &mut post.replies {
                for attachment in &mut reply.attachments {
                    resolve_one(attachment, base_path, archive);
                }
            }
        }
        ImportLine::DirectPost {
            direct_post: Some(post),
        } => {
            for attachment in &mut post.attachments {
                resolve_one(attachment, base_path, archive);
            }
            for reply in &mut post.replies {
                for attachment in &mut reply.attachments {
                    resolve_one(attachment, base_path, archive);
                }
            }
        }
        ImportLine::User { user: Some(user) } => {
            if let Some(image) = &mut user.profile_image {
                resolve_one(image, base_path, archive);
            }
        }
        ImportLine::Bot { bot: Some(bot) } => {
            if let Some(image) = &mut bot.profile_image {
                resolve_one(image, base_path, archive);
            }
        }
        ImportLine::Emoji { emoji: Some(emoji) } => {
            resolve_one(&mut emoji.image, base_path, archive);
        }
        _ => {}
    }
}

fn resolve_one(attachment: &mut AttachmentData, base_path: &Path, archive: Option<&ImportArchive>) {
    let joined = base_path.join(&attachment.path);
    match archive {
        Some(archive) => {
            let name = joined.to_string_lossy().into_owned();
            match archive.entry_size(&name) {
                Some(size) => {
                    attachment.source = Some(AttachmentSource::Archive { name, size });
                }
                None => {
                    log::warn!("attachment {} not found in archive", name);
                    attachment.source = Some(AttachmentSource::Missing { name });
                }
            }
        }
        None => {
            attachment.source = Some(AttachmentSource::File(joined));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn archive_with(entries: &[(&str, &[u8])]) -> ImportArchive {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        let cursor = writer.finish().unwrap();
        ImportArchive::new(cursor).unwrap()
    }

    #[test]
    fn indexes_entry_names_and_sizes() {
        let archive = archive_with(&[("data/a.txt", b"hello"), ("data/b.txt", b"hi")]);
        assert_eq!(archive.len(), 2);
        assert!(archive.contains("data/a.txt"));
        assert_eq!(archive.entry_size("data/a.txt"), Some(5));
        assert!(!archive.contains("data/c.txt"));
    }

    #[test]
    fn with_entry_reads_content_and_can_reopen() {
        let archive = archive_with(&[("data/a.txt", b"hello")]);
        for _ in 0..2 {
            let content = archive
                .with_entry("data/a.txt", |r| {
                    let mut buf = Vec::new();
                    r.read_to_end(&mut buf)?;
                    Ok(buf)
                })
                .unwrap();
            assert_eq!(content, b"hello");
        }
    }

    #[test]
    fn missing_entry_is_reported() {
        let archive = archive_with(&[("data/a.txt", b"hello")]);
        let err = archive.with_entry("nope.txt", |_| Ok(())).unwrap_err();
        assert!(matches!(err, ArchiveError::EntryMissing(_)));
    }

    #[test]
    fn resolver_binds_archive_entries_and_flags_missing_ones() {
        let archive = archive_with(&[("export/files/a.txt", b"hello")]);
        let json = r#"{"type":"post","post":{"team":"t","channel":"c","user":"u",
            "message":"m","create_at":1,
            "attachments":[{"path":"files/a.txt"},{"path":"files/gone.txt"}]}}"#;
        let mut line: ImportLine = serde_json::from_str(json).unwrap();
        resolve_attachments(&mut line, Path::new("export"), Some(&archive));

        let ImportLine::Post { post: Some(post) } = line else {
            panic!("expected post");
        };
        assert!(matches!(
            post.attachments[0].source,
            Some(AttachmentSource::Archive { ref name, size: 5 }) if name == "export/files/a.txt"
        ));
        assert!(matches!(
            post.attachments[1].source,
            Some(AttachmentSource::Missing { .. })
        ));
    }

    #[test]
    fn resolver_joins_filesystem_paths_without_archive() {
        let json = r#"{"type":"emoji","emoji":{"name":"party","image":"emoji/party.png"}}"#;
        let mut line: ImportLine = serde_json::from_str(json).unwrap();
        resolve_attachments(&mut line, Path::new("/export"), None);
        let ImportLine::Emoji { emoji: Some(emoji) } = line else {
            panic!("expected emoji");
        };
        assert!(matches!(
            emoji.image.source,
            Some(AttachmentSource::File(ref p)) if p == Path::new("/export/emoji/party.png")
        ));
    }
}
