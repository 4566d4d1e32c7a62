//! Database file I/O operations.
//!
//! This module handles reading and writing pages to the database file.
//! Pages are read and written at explicit offsets, so any number of threads
//! can read while one thread writes and syncs.

use std::fs::{File, OpenOptions};
use std::io::Read;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(not(unix))]
use std::sync::{Mutex, PoisonError};

use crate::storage::io::{Storage, StorageError, check_page_size};
use crate::storage::meta;
use crate::storage::page::{MIN_PAGE_SIZE, Page, PageNum};

/// A database file handle with low-level page I/O operations.
#[derive(Debug)]
pub struct FileStorage {
    file: File,
    page_size: usize,
    total_pages: AtomicU64,
    /// Serializes seek plus read/write where positional I/O is unavailable.
    #[cfg(not(unix))]
    cursor: Mutex<()>,
}

impl FileStorage {
    /// Open the database file at `path`, creating it if it does not exist.
    ///
    /// For an existing file the page size recorded in its meta page wins and
    /// `new_file_page_size` is ignored. A brand new (or zero-length) file
    /// uses `new_file_page_size`, as does a file whose first initialization
    /// never reached its meta page.
    pub fn open(path: &Path, new_file_page_size: usize) -> Result<Self, StorageError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(Self::new(file, new_file_page_size, 0));
        }

        // Both meta slots live inside the first MIN_PAGE_SIZE bytes, whatever the page size.
        let mut head = vec![0u8; MIN_PAGE_SIZE];
        let readable = usize::try_from(len).map_or(MIN_PAGE_SIZE, |l| l.min(MIN_PAGE_SIZE));
        file.read_exact(&mut head[..readable])?;

        let page_size = match meta::peek_page_size(&head) {
            Some(page_size) => page_size,
            None if meta::never_committed(&head) => {
                tracing::warn!(
                    "{}: initialization was interrupted before the meta page, starting over",
                    path.display()
                );
                file.set_len(0)?;
                return Ok(Self::new(file, new_file_page_size, 0));
            }
            None => {
                return Err(StorageError::Corruption(format!(
                    "{} has no valid meta slot",
                    path.display()
                )));
            }
        };

        let page_size_u64 = page_size as u64;
        if len % page_size_u64 != 0 {
            // A crash while extending the file can leave a partial trailing page.
            // Nothing committed can reference it, so it is ignored.
            tracing::warn!(
                "{}: ignoring {} trailing bytes past the last full page",
                path.display(),
                len % page_size_u64
            );
        }

        Ok(Self::new(file, page_size, len / page_size_u64))
    }

    fn new(file: File, page_size: usize, total_pages: u64) -> Self {
        Self {
            file,
            page_size,
            total_pages: AtomicU64::new(total_pages),
            #[cfg(not(unix))]
            cursor: Mutex::new(()),
        }
    }

    fn offset(&self, page_num: PageNum) -> u64 {
        page_num * self.page_size as u64
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom};
        let _cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    #[cfg(not(unix))]
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let _cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }
}

impl Storage for FileStorage {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_num: PageNum) -> Result<Page, StorageError> {
        let total_pages = self.total_pages();
        if page_num >= total_pages {
            return Err(StorageError::PageOutOfBounds {
                page_num,
                total_pages,
            });
        }

        let mut page = Page::new(self.page_size);
        self.read_at(page.as_bytes_mut(), self.offset(page_num))?;
        Ok(page)
    }

    fn write_page(&self, page_num: PageNum, page: &Page) -> Result<(), StorageError> {
        check_page_size(self.page_size, page)?;

        // Writing past the end leaves a hole that the OS zero-fills.
        self.write_at(page.as_bytes(), self.offset(page_num))?;
        self.total_pages.fetch_max(page_num + 1, Ordering::AcqRel);
        Ok(())
    }

    fn sync(&self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn total_pages(&self) -> u64 {
        self.total_pages.load(Ordering::Acquire)
    }
}
