//! Record store implementations
//!
//! [`MemoryRecordStore`] keeps records for the process lifetime only;
//! [`FileRecordStore`] persists them to a JSON file with atomic writes and
//! corruption recovery.

pub mod file;
pub mod memory;

pub use file::FileRecordStore;
pub use memory::MemoryRecordStore;
