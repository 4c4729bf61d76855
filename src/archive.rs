//! Lazy, single-pass access to compressed result bundles.
//!
//! Result bundles are gzip-compressed tar archives and CI artifacts are zip
//! archives; either can be much larger than the handful of files a caller
//! actually wants. [`ArchiveStream`] reads
//! them as a stream and hands out one entry at a time through an
//! [`EntryCursor`]:
//!
//! ```text
//!   cursor.advance() ──► entry 0 current ──► cursor.read(&scope0) ok
//!   cursor.advance() ──► entry 1 current ──► cursor.read(&scope0) StaleEntry
//!                                        └─► cursor.read(&scope1) ok
//!   cursor.advance() ──► false (exhausted)   cursor.current()    NoCurrentEntry
//! ```
//!
//! The cursor is forward-only and can't be restarted. An entry's bytes can
//! be read while it is current; once the cursor moves on, the old
//! [`EntryScope`] is stale and reading it fails with
//! [`ArchiveError::StaleEntry`] instead of returning garbage. The underlying
//! reader is released when the stream is dropped, whether or not every entry
//! was visited.
//!
//! # Example
//!
//! ```
//! use std::io::Cursor;
//! use labrunner::archive::ArchiveStream;
//!
//! # fn bundle() -> Vec<u8> {
//! #     let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
//! #         Vec::new(),
//! #         flate2::Compression::default(),
//! #     ));
//! #     let data = b"<testsuite/>";
//! #     let mut header = tar::Header::new_gnu();
//! #     header.set_size(data.len() as u64);
//! #     header.set_mode(0o644);
//! #     header.set_cksum();
//! #     builder.append_data(&mut header, "junit.xml", &data[..]).unwrap();
//! #     builder.into_inner().unwrap().finish().unwrap()
//! # }
//! let mut stream = ArchiveStream::new(Cursor::new(bundle()));
//! let mut cursor = stream.entries()?;
//! while cursor.advance()? {
//!     let scope = cursor.current()?;
//!     if scope.name.ends_with(".xml") {
//!         let bytes = cursor.read(&scope)?;
//!         assert_eq!(bytes, b"<testsuite/>");
//!     }
//! }
//! # Ok::<(), labrunner::archive::ArchiveError>(())
//! ```

use std::io::{Read, Seek, SeekFrom};

use flate2::read::GzDecoder;
use tempfile::SpooledTempFile;
use tracing::debug;

use crate::storage::{BlobReader, BlobStore, StorageResult};

/// Zip entries larger than this are spooled to a temporary file instead of
/// memory while they are current.
const ZIP_SPOOL_LIMIT: usize = 8 * 1024 * 1024;

/// Errors raised while iterating an archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// An entry's bytes were requested after the cursor moved past it.
    #[error("Archive entry {index} is no longer current (cursor is at {current})")]
    StaleEntry { index: usize, current: usize },

    /// `current()` was called before the first `advance()` or after the end.
    #[error("No current archive entry; call advance() first")]
    NoCurrentEntry,

    /// `entries()` was called a second time on the same stream.
    #[error("Archive stream was already consumed")]
    AlreadyConsumed,

    /// Decompression or read failure.
    #[error("Archive IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unsupported zip data.
    #[error("Zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Container format of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveFormat {
    /// gzip-compressed tar, used for result bundles.
    #[default]
    TarGz,
    /// zip, used by CI artifact downloads.
    Zip,
}

/// Handle for one archive entry.
///
/// A scope only carries the entry's descriptor. The payload is read through
/// [`EntryCursor::read`], which refuses scopes that are no longer current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryScope {
    /// Position of the entry among the yielded entries, starting at 0.
    pub index: usize,
    /// Path of the entry inside the archive.
    pub name: String,
    /// Uncompressed size in bytes, as declared by the archive.
    pub size: u64,
}

enum Source<R: Read> {
    TarGz(tar::Archive<GzDecoder<R>>),
    Zip(R),
}

/// An archive read as a stream.
pub struct ArchiveStream<R: Read> {
    source: Source<R>,
    consumed: bool,
}

impl ArchiveStream<BlobReader> {
    /// Opens the gzip tar archive stored at `path` without downloading it
    /// first.
    pub async fn open<B: BlobStore + ?Sized>(blob: &B, path: &str) -> StorageResult<Self> {
        debug!("Opening archive stream for {}", path);
        let reader = blob.open_read(path).await?;
        Ok(Self::new(reader))
    }
}

impl<R: Read> ArchiveStream<R> {
    /// Wraps a gzip-compressed tar stream.
    pub fn new(reader: R) -> Self {
        Self::with_format(reader, ArchiveFormat::TarGz)
    }

    /// Wraps a zip stream.
    pub fn zip(reader: R) -> Self {
        Self::with_format(reader, ArchiveFormat::Zip)
    }

    pub fn with_format(reader: R, format: ArchiveFormat) -> Self {
        let source = match format {
            ArchiveFormat::TarGz => Source::TarGz(tar::Archive::new(GzDecoder::new(reader))),
            ArchiveFormat::Zip => Source::Zip(reader),
        };
        Self {
            source,
            consumed: false,
        }
    }

    pub fn format(&self) -> ArchiveFormat {
        match self.source {
            Source::TarGz(_) => ArchiveFormat::TarGz,
            Source::Zip(_) => ArchiveFormat::Zip,
        }
    }

    /// Starts the single pass over the archive's entries.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::AlreadyConsumed` if called more than once.
    pub fn entries(&mut self) -> Result<EntryCursor<'_, R>, ArchiveError> {
        if self.consumed {
            return Err(ArchiveError::AlreadyConsumed);
        }
        self.consumed = true;
        let entries = match &mut self.source {
            Source::TarGz(archive) => Entries::Tar(archive.entries()?),
            Source::Zip(reader) => Entries::Zip(reader),
        };
        Ok(EntryCursor {
            entries,
            current: None,
            next_index: 0,
            exhausted: false,
        })
    }

    /// Calls `f` once per file entry, in archive order.
    ///
    /// `f` gets the cursor positioned on the entry and may read it; the first
    /// error stops the pass.
    pub fn for_each_entry<F>(&mut self, mut f: F) -> Result<(), ArchiveError>
    where
        F: FnMut(&mut EntryCursor<'_, R>, EntryScope) -> Result<(), ArchiveError>,
    {
        let mut cursor = self.entries()?;
        while cursor.advance()? {
            let scope = cursor.current()?;
            f(&mut cursor, scope)?;
        }
        Ok(())
    }

    /// Reads every entry accepted by `wanted`, skipping the rest unread.
    pub fn read_matching<P>(&mut self, mut wanted: P) -> Result<Vec<(EntryScope, Vec<u8>)>, ArchiveError>
    where
        P: FnMut(&EntryScope) -> bool,
    {
        let mut found = Vec::new();
        self.for_each_entry(|cursor, scope| {
            if wanted(&scope) {
                let bytes = cursor.read(&scope)?.to_vec();
                found.push((scope, bytes));
            }
            Ok(())
        })?;
        Ok(found)
    }
}

enum Entries<'a, R: Read> {
    Tar(tar::Entries<'a, GzDecoder<R>>),
    Zip(&'a mut R),
}

/// Unread payload of the current entry.
enum EntryBody<'a, R: Read> {
    /// Tar entries are read straight from the stream.
    Tar(tar::Entry<'a, GzDecoder<R>>),
    /// The zip stream reader borrows the underlying reader per entry, so the
    /// entry is decompressed into a spool when the cursor lands on it.
    Spooled(SpooledTempFile),
}

struct CurrentEntry<'a, R: Read> {
    scope: EntryScope,
    body: EntryBody<'a, R>,
    payload: Option<Vec<u8>>,
}

/// Forward-only cursor over an [`ArchiveStream`].
///
/// Only one entry is live at a time. The cursor needs `&mut self` for every
/// state change, so it can't be shared between tasks.
pub struct EntryCursor<'a, R: Read> {
    entries: Entries<'a, R>,
    current: Option<CurrentEntry<'a, R>>,
    next_index: usize,
    exhausted: bool,
}

impl<'a, R: Read> EntryCursor<'a, R> {
    /// Returns `false` once [`advance`](Self::advance) has hit the end of the
    /// archive.
    pub fn has_next(&self) -> bool {
        !self.exhausted
    }

    /// Moves to the next file entry, invalidating the current one.
    ///
    /// Directory and other non-file entries are skipped. Returns `false` when
    /// the archive is exhausted.
    pub fn advance(&mut self) -> Result<bool, ArchiveError> {
        self.current = None;
        if self.exhausted {
            return Ok(false);
        }

        match self.next_file()? {
            None => {
                self.exhausted = true;
                Ok(false)
            }
            Some((name, size, body)) => {
                let scope = EntryScope {
                    index: self.next_index,
                    name,
                    size,
                };
                self.next_index += 1;
                self.current = Some(CurrentEntry {
                    scope,
                    body,
                    payload: None,
                });
                Ok(true)
            }
        }
    }

    fn next_file(&mut self) -> Result<Option<(String, u64, EntryBody<'a, R>)>, ArchiveError> {
        match &mut self.entries {
            Entries::Tar(entries) => {
                for entry in entries.by_ref() {
                    let entry = entry?;
                    if !entry.header().entry_type().is_file() {
                        continue;
                    }
                    let name = entry.path()?.to_string_lossy().into_owned();
                    let size = entry.size();
                    return Ok(Some((name, size, EntryBody::Tar(entry))));
                }
                Ok(None)
            }
            Entries::Zip(reader) => loop {
                let Some(mut file) = zip::read::read_zipfile_from_stream(&mut **reader)? else {
                    return Ok(None);
                };
                if file.is_dir() {
                    continue;
                }
                let name = file.name().to_string();
                let size = file.size();
                let mut spool = SpooledTempFile::new(ZIP_SPOOL_LIMIT);
                std::io::copy(&mut file, &mut spool)?;
                return Ok(Some((name, size, EntryBody::Spooled(spool))));
            },
        }
    }

    /// Returns the scope of the current entry.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::NoCurrentEntry` before the first advance and
    /// after the archive is exhausted.
    pub fn current(&self) -> Result<EntryScope, ArchiveError> {
        self.current
            .as_ref()
            .map(|c| c.scope.clone())
            .ok_or(ArchiveError::NoCurrentEntry)
    }

    /// Returns the full uncompressed payload of `scope`.
    ///
    /// The entry is read from the stream on the first call and kept until the
    /// cursor advances, so repeated reads of the current entry are fine.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveError::StaleEntry` if `scope` is not the current entry,
    /// and `ArchiveError::Io` if the stream ends before the declared size.
    pub fn read(&mut self, scope: &EntryScope) -> Result<&[u8], ArchiveError> {
        let position = self.next_index;
        let current = match self.current.as_mut() {
            Some(current) if current.scope.index == scope.index => current,
            Some(current) => {
                return Err(ArchiveError::StaleEntry {
                    index: scope.index,
                    current: current.scope.index,
                });
            }
            None => {
                return Err(ArchiveError::StaleEntry {
                    index: scope.index,
                    current: position,
                });
            }
        };

        if current.payload.is_none() {
            // The declared size is untrusted; let the buffer grow with the data.
            let mut bytes = Vec::new();
            match &mut current.body {
                EntryBody::Tar(entry) => {
                    entry.read_to_end(&mut bytes)?;
                }
                EntryBody::Spooled(spool) => {
                    spool.seek(SeekFrom::Start(0))?;
                    spool.read_to_end(&mut bytes)?;
                }
            }
            if bytes.len() as u64 != current.scope.size {
                return Err(ArchiveError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "entry {} declares {} bytes but holds {}",
                        current.scope.name,
                        current.scope.size,
                        bytes.len()
                    ),
                )));
            }
            current.payload = Some(bytes);
        }
        Ok(current.payload.as_deref().unwrap_or_default())
    }
}
