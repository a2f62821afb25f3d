//! Content-related collaborator traits.
//!
//! These are the narrow interfaces through which the transfer engine
//! consumes the wider content-sharing service: materializing a finished
//! destination file into an immutable content object, opening origin
//! streams on the serving side, and discovering additional source
//! descriptors for content already being retrieved.

use crate::*;
use std::sync::Arc;

/// An immutable retrieved-content object, produced from a finished
/// destination file by a [ContentStore].
#[derive(Debug, Clone)]
pub struct Content {
    /// The primary content identifier.
    pub content_id: ContentId,

    /// A secondary identifier distinguishing this retrieved instance
    /// of the content.
    pub instance_id: ContentId,

    /// Declared MIME type of the content.
    pub mime_type: String,

    /// Total content length in bytes.
    pub length: u64,

    /// Location of the finished local file.
    pub path: std::path::PathBuf,
}

/// Ref-counted [Content].
pub type DynContent = Arc<Content>;

/// Trait for materializing completed transfers into content objects.
pub trait ContentStore: 'static + Send + Sync + std::fmt::Debug {
    /// Given an identifier, a secondary identifier, and a finished local
    /// file plus declared MIME type, produce the immutable retrieved
    /// content object.
    fn materialize(
        &self,
        content_id: ContentId,
        instance_id: ContentId,
        path: std::path::PathBuf,
        mime_type: String,
    ) -> BoxFut<'_, FerryResult<DynContent>>;
}

/// Trait-object [ContentStore].
pub type DynContentStore = Arc<dyn ContentStore>;

/// A factory for creating ContentStore instances.
pub trait ContentStoreFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &config::Config) -> FerryResult<()>;

    /// Construct a ContentStore instance.
    fn create(
        &self,
        builder: Arc<builder::Builder>,
    ) -> BoxFut<'static, FerryResult<DynContentStore>>;
}

/// Trait-object [ContentStoreFactory].
pub type DynContentStoreFactory = Arc<dyn ContentStoreFactory>;

/// A one-shot sequential origin stream for locally held content,
/// consumed by the serving side to answer chunk requests.
pub struct OriginStream {
    /// The sequential reader. It can only be read forward once;
    /// re-serving previously streamed ranges is the job of the
    /// recovery window wrapped around it.
    pub reader: Box<dyn std::io::Read + Send>,

    /// Total stream length in bytes, if known up front.
    pub length: Option<u64>,

    /// Declared MIME type of the content.
    pub mime_type: String,
}

impl std::fmt::Debug for OriginStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginStream")
            .field("length", &self.length)
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// Trait for opening origin streams on content this node can serve.
pub trait ContentSource: 'static + Send + Sync + std::fmt::Debug {
    /// Open a fresh origin stream for the given content id.
    /// Returns None if this node does not hold the content.
    fn open(
        &self,
        content_id: ContentId,
    ) -> BoxFut<'_, FerryResult<Option<OriginStream>>>;
}

/// Trait-object [ContentSource].
pub type DynContentSource = Arc<dyn ContentSource>;

/// Trait for discovering additional source descriptors for content.
///
/// The transfer engine only performs discovery while asked to; the
/// discovery protocol itself is outside the engine's scope.
pub trait SourceLocator: 'static + Send + Sync + std::fmt::Debug {
    /// Report any descriptors currently known for the given content id,
    /// up to `limit`. Descriptors already reported may be repeated;
    /// callers de-duplicate.
    fn locate(
        &self,
        content_id: ContentId,
        limit: u32,
    ) -> BoxFut<'_, FerryResult<Vec<Url>>>;
}

/// Trait-object [SourceLocator].
pub type DynSourceLocator = Arc<dyn SourceLocator>;

/// A factory for creating SourceLocator instances.
pub trait SourceLocatorFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &config::Config) -> FerryResult<()>;

    /// Construct a SourceLocator instance.
    fn create(
        &self,
        builder: Arc<builder::Builder>,
    ) -> BoxFut<'static, FerryResult<DynSourceLocator>>;
}

/// Trait-object [SourceLocatorFactory].
pub type DynSourceLocatorFactory = Arc<dyn SourceLocatorFactory>;
