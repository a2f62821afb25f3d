#![deny(missing_docs)]
//! Ferry p2p content transfer and aggregation engine.

use ferry_api::{builder::Builder, config::Config};

mod node;
pub use node::*;

pub mod factories;

/// Construct a production-ready default builder.
///
/// - `pipe` - The default pipe module is [factories::MemPipeFactory].
/// - `content_store` - The default content store is
///   [factories::FsContentStoreFactory].
/// - `locator` - The default source locator is
///   [factories::MemLocatorFactory].
/// - `providers` - The default provider list holds a single
///   [factories::ChunkedProviderFactory].
pub fn default_builder() -> Builder {
    Builder {
        config: Config::default(),
        pipe: factories::MemPipeFactory::create(),
        content_store: factories::FsContentStoreFactory::create(),
        locator: factories::MemLocatorFactory::create(),
        providers: vec![factories::ChunkedProviderFactory::create()],
    }
}
