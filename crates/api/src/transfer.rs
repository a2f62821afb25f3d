//! Ferry transfer types.
//!
//! A transfer drives retrieval of one piece of content from one family of
//! sources. An aggregate transfer (see the ferry_core pool module) owns a
//! set of these, one per provider, and arbitrates which one is live.

use crate::*;
use std::sync::Arc;

/// The lifecycle state of a transfer.
///
/// State is monotonic toward a finished state, with the exception of
/// [TransferState::Stalled], which may recover to
/// [TransferState::Retrieving].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// The transfer has been constructed but not started.
    Pending,

    /// The transfer is actively moving bytes.
    Retrieving,

    /// No byte progress has been observed within the stall timeout,
    /// or all known sources were exhausted without success.
    Stalled,

    /// The transfer finished and its content is available.
    Completed,

    /// The transfer was cancelled by the caller.
    Cancelled,

    /// The transfer failed permanently.
    Failed,
}

impl TransferState {
    /// True while the transfer is actively moving bytes.
    pub fn is_retrieving(&self) -> bool {
        matches!(self, Self::Retrieving)
    }

    /// True once the transfer has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// True only for a completed transfer.
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// The source-location state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocationState {
    /// True while the transfer is actively discovering sources.
    pub locating: bool,

    /// True once the transfer has found at least as many sources as its
    /// assigned goal's threshold.
    pub saturated: bool,
}

/// Names the purpose a transfer's discovery threshold serves.
///
/// The two counts backing these goals are policy thresholds defined
/// externally per content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocationGoal {
    /// The threshold at which a standby transfer may stop discovering.
    Enough,

    /// The threshold at which the active transfer may stop discovering.
    Many,
}

/// A descriptor naming content together with explicit remote holders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDescriptor {
    /// The content identifier.
    pub content_id: ContentId,

    /// Known holders of the content.
    pub sources: Vec<Url>,

    /// Declared MIME type, if known.
    pub mime_type: Option<String>,

    /// Total content length in bytes, if known.
    pub length: Option<u64>,
}

/// A reference to content to be retrieved: either a bare identifier, or a
/// descriptor naming one or more remote holders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentRef {
    /// Content known only by identifier. Sources must be discovered.
    Id(ContentId),

    /// Content with explicit known holders.
    Descriptor(ContentDescriptor),
}

impl ContentRef {
    /// The content identifier this reference names.
    pub fn content_id(&self) -> &ContentId {
        match self {
            Self::Id(id) => id,
            Self::Descriptor(d) => &d.content_id,
        }
    }

    /// Any holders explicitly named by this reference.
    pub fn sources(&self) -> &[Url] {
        match self {
            Self::Id(_) => &[],
            Self::Descriptor(d) => d.sources.as_slice(),
        }
    }
}

/// Events emitted by transfers to registered listeners.
///
/// Callbacks run outside any transfer-internal lock. A callback that
/// returns an error is logged individually; it cannot break event
/// delivery to other listeners or corrupt transfer state.
pub trait TransferListener: 'static + Send + Sync + std::fmt::Debug {
    /// Byte-level progress: `written` bytes are durably in the
    /// destination, of `total` expected bytes when known.
    fn on_progress(
        &self,
        content_id: &ContentId,
        written: u64,
        total: Option<u64>,
    ) -> FerryResult<()> {
        drop((content_id, written, total));
        Ok(())
    }

    /// The transfer's lifecycle state changed.
    fn on_state(
        &self,
        content_id: &ContentId,
        state: TransferState,
    ) -> FerryResult<()> {
        drop((content_id, state));
        Ok(())
    }

    /// The transfer's source-location state changed; `found` is the
    /// count of sources known so far.
    fn on_location(
        &self,
        content_id: &ContentId,
        state: LocationState,
        found: u32,
    ) -> FerryResult<()> {
        drop((content_id, state, found));
        Ok(())
    }

    /// An aggregate transfer selected a new live source. Fires before
    /// any state event sourced from the newly selected transfer, so
    /// listeners always see a source before its state.
    fn on_source_selected(
        &self,
        content_id: &ContentId,
        selected: &DynTransfer,
    ) -> FerryResult<()> {
        drop((content_id, selected));
        Ok(())
    }
}

/// Trait-object [TransferListener].
pub type DynTransferListener = Arc<dyn TransferListener>;

/// Trait for implementing a transfer module that retrieves one piece of
/// content from one family of sources.
pub trait Transfer: 'static + Send + Sync + std::fmt::Debug {
    /// The content this transfer retrieves.
    fn content_id(&self) -> ContentId;

    /// Current lifecycle state.
    fn state(&self) -> TransferState;

    /// The retrieved content, present once `state().is_successful()`.
    fn content(&self) -> Option<DynContent>;

    /// The first concrete failure cause captured, if any.
    fn failure_cause(&self) -> Option<FerryError>;

    /// Current source-location state.
    fn location_state(&self) -> LocationState;

    /// Count of sources known so far.
    fn found_source_count(&self) -> u32;

    /// Begin discovering sources toward the given goal's threshold.
    /// Idempotent; a transfer already at or beyond the threshold
    /// reports itself saturated without discovering.
    fn start_source_location(&self, goal: LocationGoal);

    /// Stop discovering sources. Idempotent.
    fn stop_source_location(&self);

    /// Begin moving bytes into the destination file. Must be called at
    /// most once per transfer.
    fn start(&self, destination: std::path::PathBuf) -> FerryResult<()>;

    /// Cancel this transfer. The transfer settles into
    /// [TransferState::Cancelled] and releases its resources.
    fn cancel(&self);

    /// Register a listener for transfer events.
    fn add_listener(&self, listener: DynTransferListener);

    /// Remove a previously registered listener (matched by identity).
    fn remove_listener(&self, listener: &DynTransferListener);
}

/// Trait-object [Transfer].
pub type DynTransfer = Arc<dyn Transfer>;

/// Trait for implementing a provider: one route by which content may be
/// obtained.
pub trait Provider: 'static + Send + Sync + std::fmt::Debug {
    /// Construct a transfer for the given content reference.
    ///
    /// A provider may decline by returning `Ok(None)`, or signal that it
    /// does not support the reference kind with
    /// [FerryError::Unsupported]; aggregate construction tolerates both.
    fn create_transfer(
        &self,
        content: &ContentRef,
    ) -> BoxFut<'_, FerryResult<Option<DynTransfer>>>;
}

/// Trait-object [Provider].
pub type DynProvider = Arc<dyn Provider>;

/// A factory for creating Provider instances.
pub trait ProviderFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &config::Config) -> FerryResult<()>;

    /// Construct a Provider instance.
    fn create(
        &self,
        builder: Arc<builder::Builder>,
        pipe: pipe::DynPipe,
        content_store: DynContentStore,
        locator: DynSourceLocator,
    ) -> BoxFut<'static, FerryResult<DynProvider>>;
}

/// Trait-object [ProviderFactory].
pub type DynProviderFactory = Arc<dyn ProviderFactory>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_predicates() {
        use TransferState::*;

        for s in [Pending, Retrieving, Stalled] {
            assert!(!s.is_finished());
            assert!(!s.is_successful());
        }
        for s in [Completed, Cancelled, Failed] {
            assert!(s.is_finished());
            assert!(!s.is_retrieving());
        }
        assert!(Retrieving.is_retrieving());
        assert!(Completed.is_successful());
        assert!(!Cancelled.is_successful());
        assert!(!Failed.is_successful());
    }

    #[test]
    fn content_ref_accessors() {
        let id = ContentId::from(bytes::Bytes::from_static(b"c1"));
        let bare = ContentRef::Id(id.clone());
        assert_eq!(&id, bare.content_id());
        assert!(bare.sources().is_empty());

        let url = Url::from_str("ws://a.b:80/1").unwrap();
        let desc = ContentRef::Descriptor(ContentDescriptor {
            content_id: id.clone(),
            sources: vec![url.clone()],
            mime_type: Some("application/octet-stream".into()),
            length: Some(1024),
        });
        assert_eq!(&id, desc.content_id());
        assert_eq!(&[url][..], desc.sources());
    }
}
