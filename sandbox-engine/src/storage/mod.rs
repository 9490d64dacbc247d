mod allocator;
mod error;

pub use allocator::{StorageAllocator, StorageCaps};
pub use error::StorageError;
