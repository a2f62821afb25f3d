//! The core stub source locator implementation provided by ferry.

use ferry_api::{builder, config::Config, content::*, *};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The core stub source locator implementation provided by ferry.
/// This is NOT a production module. It is for testing only.
/// Sources are announced into it directly by test code.
#[derive(Debug)]
pub struct MemLocatorFactory {}

impl MemLocatorFactory {
    /// Construct a new MemLocatorFactory.
    pub fn create() -> DynSourceLocatorFactory {
        let out: DynSourceLocatorFactory = Arc::new(MemLocatorFactory {});
        out
    }
}

impl SourceLocatorFactory for MemLocatorFactory {
    fn default_config(&self, _config: &Config) -> FerryResult<()> {
        Ok(())
    }

    fn create(
        &self,
        _builder: Arc<builder::Builder>,
    ) -> BoxFut<'static, FerryResult<DynSourceLocator>> {
        Box::pin(async move {
            let out: DynSourceLocator = Arc::new(MemLocator::default());
            Ok(out)
        })
    }
}

/// In-memory source locator. Test code announces descriptors with
/// [MemLocator::announce]; transfers polling [SourceLocator::locate]
/// see them on their next poll.
#[derive(Debug, Default)]
pub struct MemLocator {
    known: Mutex<HashMap<ContentId, Vec<Url>>>,
}

impl MemLocator {
    /// Construct a new MemLocator wrapped in an Arc.
    pub fn create() -> Arc<MemLocator> {
        Arc::new(MemLocator::default())
    }

    /// Announce a source descriptor for a content id.
    pub fn announce(&self, content_id: ContentId, source: Url) {
        let mut lock = self.known.lock().unwrap();
        let entry = lock.entry(content_id).or_default();
        if !entry.contains(&source) {
            entry.push(source);
        }
    }
}

impl SourceLocator for MemLocator {
    fn locate(
        &self,
        content_id: ContentId,
        limit: u32,
    ) -> BoxFut<'_, FerryResult<Vec<Url>>> {
        Box::pin(async move {
            let lock = self.known.lock().unwrap();
            Ok(lock
                .get(&content_id)
                .map(|urls| {
                    urls.iter().take(limit as usize).cloned().collect()
                })
                .unwrap_or_default())
        })
    }
}
