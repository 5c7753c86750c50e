//! CAS transfer core: existence probing, batching, bounded-concurrency
//! dispatch, and the Reader family (spec.md §4).
//!
//! `batcher`/`prober`/`batch_uploader`/`stream_uploader`/`driver` implement
//! the upload pipeline (§4.A-E); `reader`/`output` implement the download
//! side and output flattening (§4.F). `client::cas`/`client::bytestream`
//! beneath this module are the thin RPC transport; everything here is pure
//! orchestration over that transport plus the retry engine.

pub mod batch_uploader;
pub mod batcher;
pub mod driver;
pub mod output;
pub mod prober;
pub mod reader;
pub mod stream_uploader;

pub use batch_uploader::BatchUploader;
pub use batcher::{Batch, make_batches};
pub use driver::BulkTransferDriver;
pub use output::{Output, OutputFlattener};
pub use prober::ExistenceProber;
pub use reader::Reader;
pub use stream_uploader::StreamUploader;
