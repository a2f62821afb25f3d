//! The top-level ferry node: module instances resolved from a builder,
//! plus entry points for retrieving and serving content.

use crate::factories::core_pool::CorePoolModConfig;
use crate::factories::core_serve::CoreServeModConfig;
use crate::factories::{ContentServer, PoolTransfer};
use ferry_api::{builder::Builder, content::*, pipe::DynPipe, transfer::*, *};
use std::sync::Arc;

/// A running ferry node. Holds the pipe, the content store, the source
/// locator, and the resolved provider list shared by every aggregate
/// transfer this node creates.
#[derive(Debug)]
pub struct FerryNode {
    builder: Arc<Builder>,
    pipe: DynPipe,
    content_store: DynContentStore,
    providers: Vec<DynProvider>,
}

impl FerryNode {
    /// Resolve every module factory on the builder and assemble a node.
    pub async fn create(builder: Arc<Builder>) -> FerryResult<Arc<Self>> {
        let pipe = builder.pipe.create(builder.clone()).await?;
        let content_store =
            builder.content_store.create(builder.clone()).await?;
        let locator = builder.locator.create(builder.clone()).await?;

        let mut providers = Vec::with_capacity(builder.providers.len());
        for factory in builder.providers.iter() {
            providers.push(
                factory
                    .create(
                        builder.clone(),
                        pipe.clone(),
                        content_store.clone(),
                        locator.clone(),
                    )
                    .await?,
            );
        }

        Ok(Arc::new(Self {
            builder,
            pipe,
            content_store,
            providers,
        }))
    }

    /// The url peers should use to reach this node, if bound.
    pub fn url(&self) -> Option<Url> {
        self.pipe.url()
    }

    /// The message pipe this node communicates over.
    pub fn pipe(&self) -> &DynPipe {
        &self.pipe
    }

    /// The content store materializing this node's completed transfers.
    pub fn content_store(&self) -> &DynContentStore {
        &self.content_store
    }

    /// Construct an aggregate transfer retrieving the given content
    /// reference through this node's providers.
    pub async fn retrieve(
        &self,
        content: ContentRef,
    ) -> FerryResult<Arc<PoolTransfer>> {
        let config: CorePoolModConfig =
            self.builder.config.get_module_config()?;
        PoolTransfer::create(config.core_pool, &self.providers, content)
            .await
    }

    /// Begin answering chunk requests for content held in the given
    /// source. Serving stops when the returned instance is dropped.
    pub fn serve(
        &self,
        source: DynContentSource,
    ) -> FerryResult<Arc<ContentServer>> {
        let config: CoreServeModConfig =
            self.builder.config.get_module_config()?;
        Ok(ContentServer::create(
            config.core_serve,
            self.pipe.clone(),
            source,
        ))
    }
}
