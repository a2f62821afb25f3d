//! Ferry pipe related types.
//!
//! A pipe is the message-oriented channel abstraction the transfer engine
//! runs over: open an outbound channel to a source descriptor (may time
//! out), bind module-named inboxes reachable at this node's url, and
//! send/receive length-delimited messages. The channel is unreliable;
//! the chunk protocol's slot timeouts carry all retry responsibility.

use crate::protocol::*;
use crate::*;
use prost::Message;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Handler for messages addressed to one registered module inbox.
pub trait PipeModuleHandler: 'static + Send + Sync + std::fmt::Debug {
    /// The sync handler for receiving module messages sent by a remote
    /// peer. If this callback returns an error, the message is dropped
    /// and the error logged; the sending peer is not informed.
    fn recv_module_msg(
        &self,
        peer: Url,
        module: String,
        data: bytes::Bytes,
    ) -> FerryResult<()>;
}

/// Trait-object [PipeModuleHandler].
pub type DynPipeModuleHandler = Arc<dyn PipeModuleHandler>;

/// This is the low-level backend pipe handler designed to work
/// with [DefaultPipe]. Construct using [PipeImpHnd::new], then call
/// [DefaultPipe::create] to return the high-level pipe from the
/// [PipeFactory].
pub struct PipeImpHnd {
    mod_map: Arc<Mutex<HashMap<String, DynPipeModuleHandler>>>,
}

impl PipeImpHnd {
    /// When constructing a [Pipe] from a [PipeFactory],
    /// you need a [PipeImpHnd] for routing incoming data.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mod_map: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Call this whenever data is received on an open channel.
    pub fn recv_data(&self, peer: Url, data: bytes::Bytes) -> FerryResult<()> {
        let env = PipeEnvelope::decode(data).map_err(|err| {
            FerryError::other_src(
                format!("could not decode pipe envelope from {peer}"),
                err,
            )
        })?;

        let handler =
            self.mod_map.lock().unwrap().get(&env.module).cloned();

        match handler {
            Some(handler) => {
                handler.recv_module_msg(peer, env.module, env.data)
            }
            None => {
                // Inboxes are unregistered when a transfer attempt ends,
                // so late responses for a closed inbox are expected.
                tracing::trace!(
                    module = %env.module,
                    %peer,
                    "dropping message for unregistered module",
                );
                Ok(())
            }
        }
    }
}

/// A low-level pipe implementation.
pub trait PipeImp: 'static + Send + Sync + std::fmt::Debug {
    /// Get the current url this node can be reached at, if any.
    fn url(&self) -> Option<Url>;

    /// Indicates that the implementation should send the payload to the
    /// remote peer, opening a channel if needed. Opening may time out.
    fn send(&self, peer: Url, data: bytes::Bytes)
        -> BoxFut<'_, FerryResult<()>>;

    /// Indicates that the implementation should close any open channel
    /// to the given peer.
    fn close(&self, peer: Url) -> BoxFut<'_, ()>;
}

/// Trait-object [PipeImp].
pub type DynPipeImp = Arc<dyn PipeImp>;

/// The high-level message pipe used by transfer modules.
pub trait Pipe: 'static + Send + Sync + std::fmt::Debug {
    /// Get the url peers should use to reach this node, if bound.
    fn url(&self) -> Option<Url>;

    /// Register a module handler for receiving incoming module messages.
    ///
    /// Panics if you attempt to register a duplicate handler for the
    /// same module name.
    fn register_module_handler(
        &self,
        module: String,
        handler: DynPipeModuleHandler,
    );

    /// Remove a previously registered module handler. Messages arriving
    /// for the module afterwards are dropped. Unknown names are ignored.
    fn unregister_module_handler(&self, module: &str);

    /// Send a payload to a module inbox on a remote peer. This is a
    /// fire-and-forget type message. The future this call returns will
    /// indicate any errors that occur up to the point where the message
    /// is handed off to the pipe backend. After that, the future will
    /// return `Ok(())` but the remote peer may or may not actually
    /// receive the message.
    fn send_module(
        &self,
        peer: Url,
        module: String,
        data: bytes::Bytes,
    ) -> BoxFut<'_, FerryResult<()>>;

    /// Close any open channel to the given peer.
    fn close(&self, peer: Url) -> BoxFut<'_, ()>;
}

/// Trait-object [Pipe].
pub type DynPipe = Arc<dyn Pipe>;

/// A high-level wrapper around a low-level [DynPipeImp] pipe
/// implementation.
#[derive(Clone, Debug)]
pub struct DefaultPipe {
    imp: DynPipeImp,
    mod_map: Arc<Mutex<HashMap<String, DynPipeModuleHandler>>>,
}

impl DefaultPipe {
    /// When constructing a [Pipe] from a [PipeFactory],
    /// this function does the actual wrapping of your implementation
    /// to produce the [Pipe] struct.
    ///
    /// [DefaultPipe] is built to be used with the provided [PipeImpHnd].
    pub fn create(hnd: &PipeImpHnd, imp: DynPipeImp) -> DynPipe {
        let out: DynPipe = Arc::new(DefaultPipe {
            imp,
            mod_map: hnd.mod_map.clone(),
        });
        out
    }
}

impl Pipe for DefaultPipe {
    fn url(&self) -> Option<Url> {
        self.imp.url()
    }

    fn register_module_handler(
        &self,
        module: String,
        handler: DynPipeModuleHandler,
    ) {
        if self
            .mod_map
            .lock()
            .unwrap()
            .insert(module.clone(), handler)
            .is_some()
        {
            panic!("Attempted to register duplicate module handler! {module}");
        }
    }

    fn unregister_module_handler(&self, module: &str) {
        self.mod_map.lock().unwrap().remove(module);
    }

    fn send_module(
        &self,
        peer: Url,
        module: String,
        data: bytes::Bytes,
    ) -> BoxFut<'_, FerryResult<()>> {
        Box::pin(async move {
            let enc = serialize_envelope(module, data);
            self.imp.send(peer, enc).await
        })
    }

    fn close(&self, peer: Url) -> BoxFut<'_, ()> {
        self.imp.close(peer)
    }
}

/// A factory for constructing Pipe instances.
pub trait PipeFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &config::Config) -> FerryResult<()>;

    /// Construct a pipe instance.
    fn create(
        &self,
        builder: Arc<builder::Builder>,
    ) -> BoxFut<'static, FerryResult<DynPipe>>;
}

/// Trait-object [PipeFactory].
pub type DynPipeFactory = Arc<dyn PipeFactory>;
