//! Streaming S3 transport: a per-object pipeline that turns sequential
//! writes into an S3 multipart upload and ranged S3 reads into sequential
//! reads, coordinated across threads and processes (§2, §3).

pub mod callbacks;
pub mod circular_buffer;
pub mod config;
pub mod download;
pub mod error;
pub mod hostname;
pub mod path;
pub mod process_init;
pub mod retry;
pub mod rt;
pub mod shared_record;
pub mod transport;
pub mod upload;

pub use config::Config;
pub use error::{ErrorCode, Result, TransportError};
pub use transport::{OpenMode, Transport};
