pub mod backend;
pub mod memory;
pub mod s3;

pub use backend::{Storage, METADATA_MODIFIED_TIME, METADATA_UPLOAD_TIME};
pub use memory::MemoryStorage;
pub use s3::S3Storage;
