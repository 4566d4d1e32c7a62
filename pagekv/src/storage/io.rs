//! Storage abstraction over fixed-size pages.
//!
//! This module provides a `Storage` trait that abstracts over page-based storage
//! operations, allowing the engine to use real file I/O in production and
//! in-memory storage with fault injection in tests.
//!
//! # Design
//!
//! The trait is a minimal page-I/O contract:
//! - Page read/write by page number
//! - Implicit file extension when writing past the end
//! - Durability via `sync`
//!
//! Everything above it (node encoding, freelist, meta page) lives in the node store.

use crate::storage::page::{Page, PageNum};

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Page out of bounds.
    PageOutOfBounds { page_num: PageNum, total_pages: u64 },
    /// Page buffer does not match the storage page size.
    PageSizeMismatch { expected: usize, actual: usize },
    /// Injected fault for simulation.
    InjectedFault(String),
    /// Corruption detected.
    Corruption(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PageOutOfBounds {
                page_num,
                total_pages,
            } => write!(
                f,
                "page {page_num} out of bounds (total pages: {total_pages})"
            ),
            Self::PageSizeMismatch { expected, actual } => {
                write!(f, "page buffer is {actual} bytes, storage uses {expected}")
            }
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over page-based storage operations.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `read_page` returns the last written content for a page
/// - `write_page` past the current end extends the storage
/// - `sync` makes all previous writes durable
/// - every method is safe to call from several threads at once, so readers
///   can fetch pages while a commit writes and syncs others
pub trait Storage: Send + Sync {
    /// Size of every page in bytes.
    fn page_size(&self) -> usize;

    /// Read a page from storage.
    ///
    /// Returns an error if the page number is out of bounds.
    fn read_page(&self, page_num: PageNum) -> Result<Page, StorageError>;

    /// Write a page to storage, extending it if `page_num` is past the end.
    ///
    /// The write may be buffered until `sync` is called.
    fn write_page(&self, page_num: PageNum, page: &Page) -> Result<(), StorageError>;

    /// Sync all pending writes to durable storage.
    fn sync(&self) -> Result<(), StorageError>;

    /// Get the total number of pages in storage.
    fn total_pages(&self) -> u64;

    /// Whether the storage holds no pages at all (a brand new database).
    fn is_empty(&self) -> bool {
        self.total_pages() == 0
    }
}

/// Check a page buffer against the storage page size before writing it.
pub(crate) fn check_page_size(expected: usize, page: &Page) -> Result<(), StorageError> {
    if page.size() == expected {
        Ok(())
    } else {
        Err(StorageError::PageSizeMismatch {
            expected,
            actual: page.size(),
        })
    }
}
