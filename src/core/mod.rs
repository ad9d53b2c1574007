pub mod constants;
pub mod errors;
pub mod options;
pub mod value;
pub mod item_id;
pub mod storage_address;
pub mod buffer_pool;
pub mod page_cache;
pub mod stats;
pub mod paged;
pub mod index_query;
pub mod btree;
pub mod loggable;
pub mod journal;
pub mod dom_page;
pub mod overflow;
pub mod record_store;
pub mod node_value;
pub mod iterator;
pub mod recovery;

pub use constants::*;
pub use btree::BTreeIndex;
pub use index_query::{IndexQuery, Operator};
pub use iterator::{NodeIterator, RawNodeIterator, RawRecord};
pub use journal::{Journal, Txn};
pub use loggable::{LogEntry, LogRecord};
pub use options::StoreOptions;
pub use paged::{Page, PagedFile, PagedStore};
pub use record_store::{RecordStore, WriterSession};
pub use recovery::RecoveryReport;
pub use stats::{BufferStats, StoreStats, TreeStatistics};
pub use value::Value;
