//! In-memory storage for deterministic testing.
//!
//! `MemoryStorage` implements the `Storage` trait over a page map and adds
//! fault injection:
//! - Random read/write/sync errors and torn writes, driven by a seeded RNG
//! - Scripted failures (`fail_after_writes`, `fail_syncs`, `tear_next_write`)
//! - Crash simulation: writes not yet synced are lost on `crash`
//!
//! The handle is cheap to clone and every clone sees the same pages, so a
//! test can keep one clone while the database owns another, then reopen the
//! database from the surviving state.

// Test storage legitimately clones pages and handles
#![allow(clippy::disallowed_methods)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::io::{Storage, StorageError, check_page_size};
use crate::storage::page::{Page, PageNum};

/// Configuration for random fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Probability of a torn write (0.0 - 1.0): only a prefix of the page
    /// reaches storage and the write fails.
    pub partial_write_rate: f64,
}

/// Statistics about storage operations.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorageStats {
    /// Number of page reads.
    pub reads: u64,
    /// Number of page writes.
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected sync errors.
    pub injected_sync_errors: u64,
    /// Number of torn writes.
    pub partial_writes: u64,
}

#[derive(Debug)]
struct MemoryState {
    page_size: usize,
    /// Pages that survive a crash.
    durable: HashMap<PageNum, Page>,
    durable_pages: u64,
    /// Writes since the last sync.
    volatile: HashMap<PageNum, Page>,
    total_pages: u64,

    fault_config: FaultConfig,
    rng: StdRng,
    /// Remaining successful writes before every write fails.
    writes_until_failure: Option<u64>,
    fail_syncs: bool,
    /// Page and byte count of the next scripted torn write.
    torn_write: Option<(PageNum, usize)>,

    write_log: Vec<PageNum>,
    stats: MemoryStorageStats,
}

impl MemoryState {
    fn should_inject_fault(&mut self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.random::<f64>() < rate
    }
}

/// In-memory page storage with fault injection.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    /// Create an empty storage with no faults.
    ///
    /// The seed drives every random fault decision, so the same seed
    /// produces the same fault sequence.
    #[must_use]
    pub fn new(page_size: usize, seed: u64) -> Self {
        Self::with_config(page_size, seed, FaultConfig::default())
    }

    /// Create an empty storage with the given fault configuration.
    #[must_use]
    pub fn with_config(page_size: usize, seed: u64, fault_config: FaultConfig) -> Self {
        let state = MemoryState {
            page_size,
            durable: HashMap::new(),
            durable_pages: 0,
            volatile: HashMap::new(),
            total_pages: 0,
            fault_config,
            rng: StdRng::seed_from_u64(seed),
            writes_until_failure: None,
            fail_syncs: false,
            torn_write: None,
            write_log: Vec::new(),
            stats: MemoryStorageStats::default(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A panic in another test thread must not hide the pages from this one.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the operation counters.
    #[must_use]
    pub fn stats(&self) -> MemoryStorageStats {
        self.state().stats.clone()
    }

    /// Replace the random fault configuration.
    pub fn set_fault_config(&self, config: FaultConfig) {
        self.state().fault_config = config;
    }

    /// Let `n` more writes succeed, then fail every write.
    pub fn fail_after_writes(&self, n: u64) {
        self.state().writes_until_failure = Some(n);
    }

    /// Fail (or stop failing) every sync.
    pub fn fail_syncs(&self, fail: bool) {
        self.state().fail_syncs = fail;
    }

    /// Tear the next write to `page_num`: only its first `len` bytes reach
    /// storage and the write fails.
    pub fn tear_next_write(&self, page_num: PageNum, len: usize) {
        self.state().torn_write = Some((page_num, len));
    }

    /// Clear all scripted and random faults.
    pub fn disarm(&self) {
        let mut state = self.state();
        state.writes_until_failure = None;
        state.fail_syncs = false;
        state.torn_write = None;
        state.fault_config = FaultConfig::default();
    }

    /// Simulate a power loss: every write since the last successful sync is lost.
    pub fn crash(&self) {
        let mut guard = self.state();
        let state = &mut *guard;
        let lost = state.volatile.len();
        state.volatile.clear();
        state.total_pages = state.durable_pages;
        tracing::debug!("simulated crash dropped {lost} unsynced pages");
    }

    /// Page numbers written so far, in write order.
    #[must_use]
    pub fn write_log(&self) -> Vec<PageNum> {
        self.state().write_log.clone()
    }

    /// Forget the recorded write order.
    pub fn clear_write_log(&self) {
        self.state().write_log.clear();
    }

    /// Flip the bits of one byte of a page, durable copy included.
    pub fn corrupt_byte(&self, page_num: PageNum, offset: usize) {
        let mut guard = self.state();
        let state = &mut *guard;
        let page_size = state.page_size;
        for pages in [&mut state.durable, &mut state.volatile] {
            if let Some(page) = pages.get_mut(&page_num) {
                let bytes = page.as_bytes_mut();
                bytes[offset % page_size] ^= 0xFF;
            }
        }
    }
}

impl Storage for MemoryStorage {
    fn page_size(&self) -> usize {
        self.state().page_size
    }

    fn read_page(&self, page_num: PageNum) -> Result<Page, StorageError> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.stats.reads += 1;

        if page_num >= state.total_pages {
            return Err(StorageError::PageOutOfBounds {
                page_num,
                total_pages: state.total_pages,
            });
        }

        let rate = state.fault_config.read_error_rate;
        if state.should_inject_fault(rate) {
            state.stats.injected_read_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        let page = state
            .volatile
            .get(&page_num)
            .or_else(|| state.durable.get(&page_num))
            .cloned()
            .unwrap_or_else(|| Page::new(state.page_size));
        Ok(page)
    }

    fn write_page(&self, page_num: PageNum, page: &Page) -> Result<(), StorageError> {
        let mut guard = self.state();
        let state = &mut *guard;
        check_page_size(state.page_size, page)?;
        state.stats.writes += 1;

        match state.writes_until_failure {
            Some(0) => {
                state.stats.injected_write_errors += 1;
                return Err(StorageError::InjectedFault(format!(
                    "scripted write failure at page {page_num}"
                )));
            }
            Some(n) => state.writes_until_failure = Some(n - 1),
            None => {}
        }

        let rate = state.fault_config.write_error_rate;
        if state.should_inject_fault(rate) {
            state.stats.injected_write_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        let scripted_tear = state
            .torn_write
            .take_if(|(torn_page, _)| *torn_page == page_num)
            .map(|(_, len)| len);
        let rate = state.fault_config.partial_write_rate;
        let page_size = state.page_size;
        let tear = scripted_tear.or_else(|| {
            state
                .should_inject_fault(rate)
                .then(|| state.rng.random_range(0..page_size))
        });
        if let Some(len) = tear {
            // The bytes past the tear keep whatever the page held before.
            state.stats.partial_writes += 1;
            let mut torn = state
                .volatile
                .get(&page_num)
                .or_else(|| state.durable.get(&page_num))
                .cloned()
                .unwrap_or_else(|| Page::new(page_size));
            let len = len.min(page_size);
            torn.write_bytes(0, &page.as_bytes()[..len]);
            state.volatile.insert(page_num, torn);
            state.write_log.push(page_num);
            if page_num >= state.total_pages {
                state.total_pages = page_num + 1;
            }
            return Err(StorageError::InjectedFault(format!(
                "simulated torn write of page {page_num} after {len} bytes"
            )));
        }

        let page_to_write = page.clone();
        state.volatile.insert(page_num, page_to_write);
        state.write_log.push(page_num);
        if page_num >= state.total_pages {
            state.total_pages = page_num + 1;
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), StorageError> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.stats.syncs += 1;

        let rate = state.fault_config.sync_error_rate;
        if state.fail_syncs || state.should_inject_fault(rate) {
            state.stats.injected_sync_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }

        let written: Vec<(PageNum, Page)> = state.volatile.drain().collect();
        state.durable.extend(written);
        state.durable_pages = state.total_pages;
        Ok(())
    }

    fn total_pages(&self) -> u64 {
        self.state().total_pages
    }
}
