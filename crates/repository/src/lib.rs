//! # Repository
//!
//! On-disk store for recorded sessions.
//!
//! - [`FragmentWriter`] appends packets to one fragment file
//! - [`Repository`] indexes fragments into sessions, tracks delivery and
//!   deletes what is no longer wanted
//! - [`FragmentLedger`] is shared with writers so readers never touch a
//!   fragment that is still being written

mod error;
mod fragment;
mod index;
mod ledger;
mod prune;
mod reader;

pub use error::{RepositoryError, Result};
pub use fragment::{
    fragment_file_name, open_fragment, parse_fragment_file_name, scan_fragment, FragmentScan,
    FragmentWriter, FRAGMENT_EXTENSION, FRAGMENT_FORMAT_VERSION, FRAGMENT_MAGIC,
};
pub use index::{Repository, INDEX_FILE_NAME};
pub use ledger::{FragmentLedger, OpenFragment};
pub use prune::{PrunePolicy, PruneReport};
pub use reader::SessionPackets;
