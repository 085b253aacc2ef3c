//! Per-class commit logs
//!
//! Each table class (root, metadata, system, user) has its own log
//! directory of numbered, immutable fragments. Blocks carry table-tagged
//! key/value pairs or link to another log directory, which is how a
//! transfer log built during failover is spliced into a node's main log.

mod block;
mod errors;
mod kv;
mod reader;
mod writer;

pub use block::{decode_block, encode_data_block, encode_link_block, Block, BlockBody, BlockHeader};
pub use errors::{CommitLogError, CommitLogResult};
pub use kv::{Key, KeyValue};
pub use reader::{list_fragments, CommitLogReader, FragmentListing, LogBlock};
pub use writer::{write_mark, CommitLog};
