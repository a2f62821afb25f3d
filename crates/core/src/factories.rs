//! Factories for generating instances of ferry modules.

pub mod core_chunked;
pub use core_chunked::{
    ChunkedProviderFactory, ChunkedTransfer, CHUNK_REQ_MOD_NAME,
};

pub mod core_pool;
pub use core_pool::PoolTransfer;

pub mod core_serve;
pub use core_serve::{ContentServer, RecoveryWindow};

mod mem_pipe;
pub use mem_pipe::*;

mod mem_locator;
pub use mem_locator::*;

mod mem_content;
pub use mem_content::*;

mod fs_content;
pub use fs_content::*;
