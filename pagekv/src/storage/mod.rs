//! Page-oriented key/value storage engine.
//!
//! A single-file engine storing ordered collections of byte keys and values
//! in copy-on-write B-trees. One write transaction runs at a time; read
//! transactions run concurrently on the snapshot they began on.
//!
//! # File Format
//!
//! The database is stored in a single file of fixed-size pages (4KB by
//! default, any power of two from 1KB to 64KB):
//!
//! - Page 0: meta page, two checksummed slots written alternately
//! - Freelist chain: free and pending page numbers, rewritten every commit
//! - Remaining pages: B-tree nodes
//!
//! Every page starts with an 8-byte header carrying its type and a CRC32.
//!
//! # Usage
//!
//! ```no_run
//! use pagekv::config::Options;
//! use pagekv::storage::Database;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open("data.db".as_ref(), Options::default())?;
//!
//! let mut tx = db.write_tx()?;
//! tx.create_collection(b"users")?.put(b"alice", b"admin")?;
//! tx.commit()?;
//!
//! let mut tx = db.read_tx()?;
//! if let Some(users) = tx.get_collection(b"users")? {
//!     assert_eq!(users.get(b"alice")?, Some(b"admin".to_vec()));
//! }
//! # Ok(())
//! # }
//! ```

pub mod btree;
mod collection;
mod database;
mod file;
mod freelist;
mod io;
pub mod memory;
mod meta;
mod node_store;
pub mod page;
mod transaction;

pub use collection::Collection;
pub use database::{Database, DatabaseError, DatabaseStats};
pub use file::FileStorage;
pub use freelist::{Freelist, FreelistError};
pub use io::{Storage, StorageError};
pub use memory::{FaultConfig, MemoryStorage, MemoryStorageStats};
pub use meta::{Meta, MetaError, TxId};
pub use node_store::{NodeStore, NodeStoreError};
pub use page::{Page, PageError, PageHeader, PageNum, PageType};
pub use transaction::{Transaction, TransactionError, TxState};
