//! Builder-related types.

use crate::*;
use std::sync::Arc;

/// The general ferry builder.
/// This contains both configuration and factory instances,
/// allowing construction of runtime module instances.
#[derive(Debug)]
pub struct Builder {
    /// The module configuration to be used when building modules.
    /// This can be loaded from disk or modified before freezing the builder.
    pub config: crate::config::Config,

    /// The [pipe::PipeFactory] to be used for creating the
    /// message [pipe::Pipe] instance.
    pub pipe: pipe::DynPipeFactory,

    /// The [content::ContentStoreFactory] to be used for creating
    /// the [content::ContentStore] instance that materializes
    /// completed transfers.
    pub content_store: content::DynContentStoreFactory,

    /// The [content::SourceLocatorFactory] to be used for creating
    /// the [content::SourceLocator] instance that discovers new
    /// source descriptors for in-flight transfers.
    pub locator: content::DynSourceLocatorFactory,

    /// The ordered list of [transfer::ProviderFactory] instances to
    /// be used for creating [transfer::Provider] instances. Aggregate
    /// transfers poll these in order when assembling candidates.
    pub providers: Vec<transfer::DynProviderFactory>,
}

impl Builder {
    /// Construct a default config given the configured module factories.
    /// Note, this should be called before freezing the Builder instance
    /// in an Arc<>.
    pub fn set_default_config(&mut self) -> FerryResult<()> {
        let Self {
            config,
            pipe,
            content_store,
            locator,
            providers,
        } = self;

        pipe.default_config(config)?;
        content_store.default_config(config)?;
        locator.default_config(config)?;
        for provider in providers.iter() {
            provider.default_config(config)?;
        }

        Ok(())
    }

    /// Apply the default config and freeze this builder for use by
    /// module factories.
    pub fn with_default_config(mut self) -> FerryResult<Self> {
        self.set_default_config()?;
        Ok(self)
    }

    /// Freeze this builder so module factories can hold it.
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }
}
