//! The file-backed content store implementation provided by ferry.

use ferry_api::{builder, config::Config, content::*, *};
use std::sync::Arc;

/// A production-ready content store backed by the local filesystem.
/// The finished destination file is taken as-is; materialization
/// records its identity and size.
#[derive(Debug)]
pub struct FsContentStoreFactory {}

impl FsContentStoreFactory {
    /// Construct a new FsContentStoreFactory.
    pub fn create() -> DynContentStoreFactory {
        let out: DynContentStoreFactory = Arc::new(FsContentStoreFactory {});
        out
    }
}

impl ContentStoreFactory for FsContentStoreFactory {
    fn default_config(&self, _config: &Config) -> FerryResult<()> {
        Ok(())
    }

    fn create(
        &self,
        _builder: Arc<builder::Builder>,
    ) -> BoxFut<'static, FerryResult<DynContentStore>> {
        Box::pin(async move {
            let out: DynContentStore = Arc::new(FsContentStore {});
            Ok(out)
        })
    }
}

#[derive(Debug)]
struct FsContentStore {}

impl ContentStore for FsContentStore {
    fn materialize(
        &self,
        content_id: ContentId,
        instance_id: ContentId,
        path: std::path::PathBuf,
        mime_type: String,
    ) -> BoxFut<'_, FerryResult<DynContent>> {
        Box::pin(async move {
            let meta = tokio::fs::metadata(&path).await.map_err(|err| {
                FerryError::other_src(
                    format!(
                        "could not stat finished content file {}",
                        path.display()
                    ),
                    err,
                )
            })?;

            Ok(Arc::new(Content {
                content_id,
                instance_id,
                mime_type,
                length: meta.len(),
                path,
            }))
        })
    }
}
