//! Meta page structure and serialization.
//!
//! The meta page occupies page 0 and records where the committed state lives:
//! the root collection's root node, the head of the freelist chain and the id
//! of the commit that produced it.
//!
//! Page 0 holds two meta slots in separate 512-byte sectors. Commit `n` writes
//! slot `n % 2`, so the previous commit's slot is untouched while the new one
//! is written. On open the valid slot with the highest transaction id wins; a
//! torn or corrupt slot falls back to the previous commit.

// Page sizes are bounded by MAX_PAGE_SIZE, which fits in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{Page, PageNum};

/// Magic number identifying a pagekv database file: "PAGEKVDB"
pub const MAGIC: [u8; 8] = *b"PAGEKVDB";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Transaction id of a commit.
pub type TxId = u64;

/// Byte offsets of the two meta slots inside page 0.
const SLOT_OFFSETS: [usize; 2] = [0, 512];

/// Meta slot field offsets (relative to the slot start).
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const PAGE_SIZE: usize = 12;
    pub const ROOT: usize = 16;
    pub const FREELIST: usize = 24;
    pub const TX_ID: usize = 32;
    pub const CHECKSUM: usize = 40;
    pub const SLOT_LEN: usize = 44;
}

/// The committed state of the database as recorded in one meta slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Meta {
    /// Format version number.
    pub format_version: u32,
    /// Page size in bytes.
    pub page_size: u32,
    /// Root page of the root collection.
    pub root: PageNum,
    /// First page of the freelist chain.
    pub freelist: PageNum,
    /// Id of the commit that wrote this slot.
    pub tx_id: TxId,
}

impl Meta {
    /// Create a meta record for the given committed state.
    #[must_use]
    pub const fn new(page_size: usize, root: PageNum, freelist: PageNum, tx_id: TxId) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size: page_size as u32,
            root,
            freelist,
            tx_id,
        }
    }

    /// Page size as recorded in the slot.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size as usize
    }

    /// Index of the slot this meta record is written to.
    #[must_use]
    pub const fn slot(&self) -> usize {
        (self.tx_id % 2) as usize
    }

    /// Serialize into this record's slot of `page`, leaving the other slot untouched.
    pub fn write_to_page(&self, page: &mut Page) {
        let base = SLOT_OFFSETS[self.slot()];
        let mut slot = [0u8; offsets::SLOT_LEN];

        slot[offsets::MAGIC..offsets::MAGIC + 8].copy_from_slice(&MAGIC);
        slot[offsets::FORMAT_VERSION..offsets::FORMAT_VERSION + 4]
            .copy_from_slice(&self.format_version.to_le_bytes());
        slot[offsets::PAGE_SIZE..offsets::PAGE_SIZE + 4]
            .copy_from_slice(&self.page_size.to_le_bytes());
        slot[offsets::ROOT..offsets::ROOT + 8].copy_from_slice(&self.root.to_le_bytes());
        slot[offsets::FREELIST..offsets::FREELIST + 8]
            .copy_from_slice(&self.freelist.to_le_bytes());
        slot[offsets::TX_ID..offsets::TX_ID + 8].copy_from_slice(&self.tx_id.to_le_bytes());

        let checksum = crc32fast::hash(&slot[..offsets::CHECKSUM]);
        slot[offsets::CHECKSUM..offsets::SLOT_LEN].copy_from_slice(&checksum.to_le_bytes());

        page.write_bytes(base, &slot);
    }

    /// Build a full page 0: this record in its slot and `previous`, the
    /// record of the last published commit, in the other one.
    #[must_use]
    pub fn to_page(&self, previous: Option<&Self>) -> Page {
        let mut page = Page::new(self.page_size());
        if let Some(previous) = previous.filter(|p| p.slot() != self.slot()) {
            previous.write_to_page(&mut page);
        }
        self.write_to_page(&mut page);
        page
    }

    /// Deserialize the newest valid meta record from page 0.
    pub fn from_page(page: &Page) -> Result<Self, MetaError> {
        let mut best: Option<Self> = None;
        let mut last_error = MetaError::InvalidMagic([0u8; 8]);

        for base in SLOT_OFFSETS {
            match decode_slot(&page.as_bytes()[base..]) {
                Ok(meta) => {
                    if best.is_none_or(|b| meta.tx_id > b.tx_id) {
                        best = Some(meta);
                    }
                }
                Err(e) => {
                    if matches!(e, MetaError::ChecksumMismatch { .. }) {
                        tracing::warn!("meta slot at offset {base} is corrupt: {e}");
                    }
                    last_error = e;
                }
            }
        }

        let meta = best.ok_or(MetaError::NoValidSlot(Box::new(last_error)))?;
        if meta.page_size() != page.size() {
            return Err(MetaError::InvalidPageSize(meta.page_size));
        }
        Ok(meta)
    }
}

/// Decode one meta slot from raw bytes.
fn decode_slot(bytes: &[u8]) -> Result<Meta, MetaError> {
    if bytes.len() < offsets::SLOT_LEN {
        return Err(MetaError::Truncated);
    }
    let read_u32 = |at: usize| {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[at..at + 4]);
        u32::from_le_bytes(buf)
    };
    let read_u64 = |at: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[at..at + 8]);
        u64::from_le_bytes(buf)
    };

    let mut magic = [0u8; 8];
    magic.copy_from_slice(&bytes[offsets::MAGIC..offsets::MAGIC + 8]);
    if magic != MAGIC {
        return Err(MetaError::InvalidMagic(magic));
    }

    let expected = read_u32(offsets::CHECKSUM);
    let actual = crc32fast::hash(&bytes[..offsets::CHECKSUM]);
    if expected != actual {
        return Err(MetaError::ChecksumMismatch { expected, actual });
    }

    let format_version = read_u32(offsets::FORMAT_VERSION);
    if format_version != FORMAT_VERSION {
        return Err(MetaError::UnsupportedVersion(format_version));
    }

    Ok(Meta {
        format_version,
        page_size: read_u32(offsets::PAGE_SIZE),
        root: read_u64(offsets::ROOT),
        freelist: read_u64(offsets::FREELIST),
        tx_id: read_u64(offsets::TX_ID),
    })
}

/// Read the page size from the first bytes of a database file.
///
/// Both slots sit inside the first `MIN_PAGE_SIZE` bytes, so this works
/// before the page size is known.
#[must_use]
pub fn peek_page_size(head: &[u8]) -> Option<usize> {
    SLOT_OFFSETS
        .iter()
        .filter_map(|&base| head.get(base..).and_then(|b| decode_slot(b).ok()))
        .max_by_key(|meta| meta.tx_id)
        .map(|meta| meta.page_size())
}

/// Whether the head of page 0 shows no commit beyond initialization was
/// ever written, so a file without a valid slot holds no data.
///
/// Commit 1 is the first to write slot 1; while that slot is still zero the
/// only state the file can have held is the empty initial one.
#[must_use]
pub fn never_committed(head: &[u8]) -> bool {
    let base = SLOT_OFFSETS[1];
    head.get(base..base + offsets::SLOT_LEN)
        .is_none_or(|slot| slot.iter().all(|&b| b == 0))
}

/// Errors that can occur when reading a meta page.
#[derive(Debug)]
pub enum MetaError {
    /// Invalid magic number.
    InvalidMagic([u8; 8]),
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Recorded page size does not match the storage.
    InvalidPageSize(u32),
    /// Slot checksum mismatch (torn or corrupt write).
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Not enough bytes for a slot.
    Truncated,
    /// Neither slot decodes; carries the last slot's error.
    NoValidSlot(Box<MetaError>),
}

impl std::fmt::Display for MetaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(
                    f,
                    "invalid magic number: {:?}",
                    String::from_utf8_lossy(magic)
                )
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidPageSize(s) => write!(f, "invalid page size: {s}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "meta checksum mismatch: expected {expected}, got {actual}")
            }
            Self::Truncated => write!(f, "meta slot truncated"),
            Self::NoValidSlot(e) => write!(f, "no valid meta slot: {e}"),
        }
    }
}

impl std::error::Error for MetaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NoValidSlot(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}
