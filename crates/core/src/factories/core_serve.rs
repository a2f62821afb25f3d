//! Serve is the ferry module answering chunk requests for locally held
//! content.
//!
//! It consists of multiple parts:
//! - A message handler registered for the chunk request module name,
//!   forwarding decoded requests into a queue
//! - A serve task that satisfies each request through a per-requester
//!   [RecoveryWindow] over the content's one-shot origin stream, so
//!   retried or late requests for ranges already streamed once can be
//!   answered without re-opening the origin
//!
//! A request whose range extends past the end of the origin stream is
//! answered with the end-of-data flag set and however many bytes remain,
//! which is how requesters learn the content boundary.

use ferry_api::{content::*, pipe::*, protocol::*, *};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{channel, Receiver, Sender};

use crate::factories::CHUNK_REQ_MOD_NAME;

mod recovery_window;
pub use recovery_window::*;

#[cfg(test)]
mod test;

/// CoreServe configuration types.
pub mod config {
    /// Configuration parameters for [ContentServer](super::ContentServer).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct CoreServeConfig {
        /// Maximum bytes read from an origin stream per read.
        /// Default: 10240.
        pub max_read_chunk_bytes: u32,

        /// Byte budget of each requester's recovery window.
        /// Default: 262144.
        pub window_budget_bytes: u32,

        /// How long an idle requester window is retained before its
        /// history is released, in milliseconds. Default: 60000.
        pub idle_window_timeout_ms: u32,
    }

    impl Default for CoreServeConfig {
        fn default() -> Self {
            Self {
                max_read_chunk_bytes: 10_240,
                window_budget_bytes: 262_144,
                idle_window_timeout_ms: 60_000,
            }
        }
    }

    /// Module-level configuration for CoreServe.
    #[derive(
        Debug, Default, Clone, serde::Serialize, serde::Deserialize,
    )]
    #[serde(rename_all = "camelCase", default)]
    pub struct CoreServeModConfig {
        /// CoreServe configuration.
        pub core_serve: CoreServeConfig,
    }

    impl ferry_api::config::ModConfig for CoreServeModConfig {}
}

pub use config::*;

type IncomingRequest = (ChunkRequest, Url);

/// Answers chunk requests for content held by this node.
#[derive(Debug)]
pub struct ContentServer {
    pipe: pipe::DynPipe,
    task: tokio::task::AbortHandle,
}

impl Drop for ContentServer {
    fn drop(&mut self) {
        self.pipe.unregister_module_handler(CHUNK_REQ_MOD_NAME);
        self.task.abort();
    }
}

impl ContentServer {
    /// Construct a ContentServer serving the given content source over
    /// the given pipe. Registers the chunk request handler; serving
    /// stops when the returned instance is dropped.
    pub fn create(
        config: CoreServeConfig,
        pipe: pipe::DynPipe,
        source: DynContentSource,
    ) -> Arc<Self> {
        let (incoming_request_tx, incoming_request_rx) = channel(1024);

        pipe.register_module_handler(
            CHUNK_REQ_MOD_NAME.to_string(),
            Arc::new(ServeMessageHandler {
                incoming_request_tx,
            }),
        );

        let task = tokio::task::spawn(serve_task(
            config,
            pipe.clone(),
            source,
            incoming_request_rx,
        ))
        .abort_handle();

        Arc::new(Self { pipe, task })
    }
}

#[derive(Debug)]
struct ServeMessageHandler {
    incoming_request_tx: Sender<IncomingRequest>,
}

impl PipeModuleHandler for ServeMessageHandler {
    fn recv_module_msg(
        &self,
        peer: Url,
        _module: String,
        data: bytes::Bytes,
    ) -> FerryResult<()> {
        use prost::Message;
        let msg = ChunkMessage::decode(data).map_err(|err| {
            FerryError::other_src(
                format!("could not decode module message from {peer}"),
                err,
            )
        })?;
        match msg.chunk_message_type() {
            ChunkMessageType::Request => {
                let request =
                    ChunkRequest::decode(msg.data).map_err(|err| {
                        FerryError::other_src(
                            format!("could not decode request from {peer}"),
                            err,
                        )
                    })?;
                self.incoming_request_tx
                    .try_send((request, peer))
                    .map_err(|err| {
                        FerryError::other_src(
                            "could not insert incoming request into queue",
                            err,
                        )
                    })
            }
            unknown_message => Err(FerryError::other(format!(
                "unexpected chunk message: {unknown_message:?}"
            ))),
        }
    }
}

/// One requester's serving state: a recovery window over the origin,
/// keyed by the requester's response inbox.
struct ServeWindow {
    window: RecoveryWindow,
    last_used: Instant,
}

async fn serve_task(
    config: CoreServeConfig,
    pipe: pipe::DynPipe,
    source: DynContentSource,
    mut incoming_request_rx: Receiver<IncomingRequest>,
) {
    let idle_timeout =
        Duration::from_millis(config.idle_window_timeout_ms as u64);
    let mut windows: HashMap<(ContentId, String), ServeWindow> =
        HashMap::new();

    while let Some((request, peer)) = incoming_request_rx.recv().await {
        windows.retain(|_, w| w.last_used.elapsed() < idle_timeout);

        let content_id = request.content_id();
        let respond_to =
            match Url::from_str(request.respond_to_url.as_str()) {
                Ok(url) => url,
                Err(err) => {
                    tracing::warn!(
                        %peer,
                        "dropping request with bad return address: {err}",
                    );
                    continue;
                }
            };

        let key = (content_id.clone(), request.respond_to_module.clone());
        if !windows.contains_key(&key) {
            let origin = match source.open(content_id.clone()).await {
                Ok(Some(origin)) => origin,
                Ok(None) => {
                    tracing::debug!(
                        %content_id,
                        %peer,
                        "dropping request for unknown content",
                    );
                    continue;
                }
                Err(err) => {
                    tracing::warn!(
                        %content_id,
                        "could not open origin stream: {err}",
                    );
                    continue;
                }
            };
            windows.insert(
                key.clone(),
                ServeWindow {
                    window: RecoveryWindow::new(
                        origin.reader,
                        config.window_budget_bytes as usize,
                        config.max_read_chunk_bytes as usize,
                    ),
                    last_used: Instant::now(),
                },
            );
        }
        let Some(serve) = windows.get_mut(&key) else {
            continue;
        };
        serve.last_used = Instant::now();

        let mut data = Vec::with_capacity(request.length as usize);
        let count = match serve.window.get_data(
            request.offset,
            request.length as usize,
            &mut data,
        ) {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(
                    %content_id,
                    offset = request.offset,
                    "could not serve range: {err}",
                );
                continue;
            }
        };

        let eof = count < 0;
        let response = ChunkResponse {
            content_id: request.content_id.clone(),
            offset: request.offset,
            length: count.unsigned_abs() as u32,
            slot: request.slot,
            eof,
            data: bytes::Bytes::from(data),
        };

        if let Err(err) = pipe
            .send_module(
                respond_to,
                request.respond_to_module.clone(),
                serialize_response_message(response),
            )
            .await
        {
            tracing::warn!(
                %content_id,
                slot = request.slot,
                "could not send chunk response: {err}",
            );
        }
    }
}
