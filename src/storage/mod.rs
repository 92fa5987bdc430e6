pub mod blob;
pub mod memory;
pub mod sqlite;
pub mod trait_def;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use memory::MemoryKv;
pub use sqlite::SqliteKv;
pub use trait_def::{delete_prefix, get_json, put_json, KvEntry, KvError, KvResult, KvStore};
