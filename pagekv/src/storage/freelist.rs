//! Free-page allocator.
//!
//! Tracks which page numbers are free for reuse and hands out new page
//! numbers. Pages released by a commit cannot be reused right away: a reader
//! that started before the commit may still reach them through its snapshot.
//! Such releases are parked as *pending* under the releasing commit's id and
//! only become free once every reader older than that commit has finished.
//!
//! # On-disk format
//!
//! The allocator state is persisted as a chain of freelist pages. A new
//! chain is written on every commit; the previous chain becomes a pending
//! release of that commit, so a meta page always points at an intact chain.
//!
//! ```text
//! [0..8)    page header (type = Freelist)
//! [8..16)   next chain page (0 = end of chain)
//! [16..20)  number of page ids on this page
//! [20..28)  highest page number ever handed out
//! [28..)    page ids, u64 little-endian
//! ```

// Chain capacities are bounded by the page size.
#![allow(clippy::cast_possible_truncation)]

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::storage::meta::TxId;
use crate::storage::page::{META_PAGE_NUM, Page, PageError, PageHeader, PageNum, PageType};

mod offsets {
    pub const NEXT: usize = 8;
    pub const COUNT: usize = 16;
    pub const MAX_PAGE: usize = 20;
    pub const IDS: usize = 28;
}

/// Size of one page id in a freelist page.
const ID_SIZE: usize = 8;

/// Number of page ids a single freelist page holds.
#[must_use]
pub const fn ids_per_page(page_size: usize) -> usize {
    (page_size - offsets::IDS) / ID_SIZE
}

/// The page allocator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Freelist {
    /// Highest page number ever handed out.
    max_page: PageNum,
    /// Pages free for immediate reuse.
    released: BTreeSet<PageNum>,
    /// Commit-time releases, keyed by the releasing commit.
    pending: BTreeMap<TxId, Vec<PageNum>>,
    /// Pages holding the currently persisted chain.
    chain: Vec<PageNum>,
}

impl Freelist {
    /// Create an allocator for a brand new database. Only the meta page is in use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out a page number: the smallest free page, else a fresh one past the end.
    pub fn get_next_page(&mut self) -> PageNum {
        if let Some(page_num) = self.released.pop_first() {
            return page_num;
        }
        self.max_page += 1;
        self.max_page
    }

    /// Make a page immediately reusable.
    ///
    /// Only for pages no committed root can reach: pages allocated and then
    /// discarded by the current write transaction, or a rollback.
    pub fn release_page(&mut self, page_num: PageNum) {
        if page_num == META_PAGE_NUM || page_num > self.max_page {
            tracing::warn!("ignoring release of page {page_num} (max page {})", self.max_page);
            return;
        }
        if !self.released.insert(page_num) {
            tracing::warn!("page {page_num} released twice");
        }
    }

    /// Park pages released by commit `tx_id` until no reader can reach them.
    pub fn free_pending(&mut self, tx_id: TxId, pages: Vec<PageNum>) {
        if pages.is_empty() {
            return;
        }
        self.pending.entry(tx_id).or_default().extend(pages);
    }

    /// Move pending releases that no open reader can reach into the free set.
    ///
    /// A reader whose snapshot is commit `r` can reach pages released by any
    /// commit after `r`, so only sets with `tx_id <= oldest_reader` are freed.
    /// With no readers open every pending set is freed.
    pub fn release_pending(&mut self, oldest_reader: Option<TxId>) {
        let still_pending = match oldest_reader {
            Some(oldest) => self.pending.split_off(&(oldest + 1)),
            None => BTreeMap::new(),
        };
        let ready = std::mem::replace(&mut self.pending, still_pending);
        for (tx_id, pages) in ready {
            tracing::debug!("releasing {} pages freed by commit {tx_id}", pages.len());
            self.released.extend(pages);
        }
    }

    /// Number of pages free for immediate reuse.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.released.len()
    }

    /// Number of pages waiting on open readers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Highest page number ever handed out.
    #[must_use]
    pub const fn max_page(&self) -> PageNum {
        self.max_page
    }

    /// Whether `page_num` is free for immediate reuse.
    #[must_use]
    pub fn is_free(&self, page_num: PageNum) -> bool {
        self.released.contains(&page_num)
    }

    /// Whether `page_num` is waiting on open readers.
    #[must_use]
    pub fn is_pending(&self, page_num: PageNum) -> bool {
        self.pending.values().any(|pages| pages.contains(&page_num))
    }

    /// Pages holding the currently persisted chain.
    #[must_use]
    pub fn chain(&self) -> &[PageNum] {
        &self.chain
    }

    /// Pages recorded on disk: everything free or pending.
    ///
    /// After a reopen no reader survives, so pending pages load as free.
    fn persisted_ids(&self) -> BTreeSet<PageNum> {
        let mut ids = self.released.clone();
        ids.extend(self.pending.values().flatten().copied());
        ids
    }

    /// Build a fresh chain for commit `tx_id`.
    ///
    /// The previous chain is parked as a pending release of `tx_id` and the
    /// new chain pages are allocated from this freelist. Returns the pages to
    /// write, head first.
    pub fn prepare_chain(&mut self, tx_id: TxId, page_size: usize) -> Vec<(PageNum, Page)> {
        let old_chain = std::mem::take(&mut self.chain);
        self.free_pending(tx_id, old_chain);

        // Allocating chain pages only shrinks the persisted set, so the
        // length computed up front always suffices.
        let per_page = ids_per_page(page_size);
        let chain_len = self.persisted_ids().len().div_ceil(per_page).max(1);
        let chain: Vec<PageNum> = (0..chain_len).map(|_| self.get_next_page()).collect();

        let ids: Vec<PageNum> = self.persisted_ids().into_iter().collect();
        let mut chunks = ids.chunks(per_page);

        let mut pages = Vec::with_capacity(chain_len);
        for (i, &page_num) in chain.iter().enumerate() {
            let chunk = chunks.next().unwrap_or(&[]);
            let next = chain.get(i + 1).copied().unwrap_or(0);

            let mut page = Page::new(page_size);
            page.write_u64(offsets::NEXT, next);
            page.write_u32(offsets::COUNT, chunk.len() as u32);
            page.write_u64(offsets::MAX_PAGE, self.max_page);
            for (j, id) in chunk.iter().enumerate() {
                page.write_u64(offsets::IDS + j * ID_SIZE, *id);
            }
            page.seal(PageType::Freelist);
            pages.push((page_num, page));
        }

        self.chain = chain;
        pages
    }

    /// Load the allocator from the chain starting at `head`.
    ///
    /// `read` fetches a page by number; any error it returns is passed through.
    pub fn read_chain<E>(
        head: PageNum,
        mut read: impl FnMut(PageNum) -> Result<Page, E>,
    ) -> Result<Self, E>
    where
        E: From<FreelistError>,
    {
        let mut freelist = Self::new();
        let mut visited = HashSet::new();
        let mut page_num = head;

        while page_num != 0 {
            if !visited.insert(page_num) {
                return Err(FreelistError::Cycle(page_num).into());
            }
            let page = read(page_num)?;
            let header = page.verify().map_err(FreelistError::Page)?;
            if header.page_type != PageType::Freelist {
                return Err(FreelistError::WrongPageType(header.page_type).into());
            }

            let count = page.read_u32(offsets::COUNT) as usize;
            let capacity = ids_per_page(page.size());
            if count > capacity {
                return Err(FreelistError::CountOverflow { count, capacity }.into());
            }

            freelist.max_page = freelist.max_page.max(page.read_u64(offsets::MAX_PAGE));
            for j in 0..count {
                freelist
                    .released
                    .insert(page.read_u64(offsets::IDS + j * ID_SIZE));
            }
            freelist.chain.push(page_num);
            page_num = page.read_u64(offsets::NEXT);
        }

        let max_page = freelist.max_page;
        if let Some(&bad) = freelist
            .released
            .iter()
            .chain(&freelist.chain)
            .find(|&&p| p == META_PAGE_NUM || p > max_page)
        {
            return Err(FreelistError::InvalidPageNum(bad).into());
        }

        tracing::debug!(
            "loaded freelist: {} free pages, max page {}",
            freelist.released.len(),
            freelist.max_page
        );
        Ok(freelist)
    }
}

/// Errors that can occur when decoding the freelist chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreelistError {
    /// Page header or checksum is invalid.
    Page(PageError),
    /// Chain link is not a freelist page.
    WrongPageType(PageType),
    /// Stored id count exceeds what a page can hold.
    CountOverflow { count: usize, capacity: usize },
    /// Page number outside the allocated range.
    InvalidPageNum(PageNum),
    /// The chain loops back onto itself.
    Cycle(PageNum),
}

impl std::fmt::Display for FreelistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Page(e) => write!(f, "freelist page: {e}"),
            Self::WrongPageType(t) => write!(f, "expected freelist page, found {t:?}"),
            Self::CountOverflow { count, capacity } => {
                write!(f, "freelist page holds {count} ids, capacity is {capacity}")
            }
            Self::InvalidPageNum(p) => write!(f, "freelist references invalid page {p}"),
            Self::Cycle(p) => write!(f, "freelist chain loops at page {p}"),
        }
    }
}

impl std::error::Error for FreelistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PageError> for FreelistError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}

// Header size is part of the layout above.
const _: () = assert!(PageHeader::SIZE == offsets::NEXT);
