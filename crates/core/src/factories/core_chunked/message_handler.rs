use ferry_api::{pipe::*, protocol::*, *};
use prost::Message;
use tokio::sync::mpsc::Sender;

/// The per-attempt response inbox. Decoded responses are forwarded into
/// the attempt's protocol loop; everything else is rejected here.
#[derive(Debug)]
pub(super) struct ChunkedMessageHandler {
    pub(super) incoming_response_tx: Sender<ChunkResponse>,
}

impl PipeModuleHandler for ChunkedMessageHandler {
    fn recv_module_msg(
        &self,
        peer: Url,
        _module: String,
        data: bytes::Bytes,
    ) -> FerryResult<()> {
        tracing::trace!("receiving module message from {peer}");
        let msg = ChunkMessage::decode(data).map_err(|err| {
            FerryError::other_src(
                format!("could not decode module message from {peer}"),
                err,
            )
        })?;
        match msg.chunk_message_type() {
            ChunkMessageType::Response => {
                let response =
                    ChunkResponse::decode(msg.data).map_err(|err| {
                        FerryError::other_src(
                            format!("could not decode response from {peer}"),
                            err,
                        )
                    })?;
                self.incoming_response_tx.try_send(response).map_err(
                    |err| {
                        FerryError::other_src(
                            "could not insert incoming response into queue",
                            err,
                        )
                    },
                )
            }
            unknown_message => Err(FerryError::other(format!(
                "unexpected chunk message: {unknown_message:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::ChunkedMessageHandler;
    use bytes::Bytes;
    use ferry_api::{pipe::PipeModuleHandler, protocol::*, *};
    use prost::Message;

    #[test]
    fn decoding_error() {
        let (incoming_response_tx, _keep) = tokio::sync::mpsc::channel(1);
        let message_handler = ChunkedMessageHandler {
            incoming_response_tx,
        };
        let peer = Url::from_str("ws://127.0.0.1:1/1").unwrap();
        let wrong_message = Bytes::from_static(b"this is not a chunk message");
        message_handler
            .recv_module_msg(peer, "ChunkResp/1".to_string(), wrong_message)
            .unwrap_err();
    }

    #[test]
    fn request_message_type_rejected() {
        let (incoming_response_tx, _keep) = tokio::sync::mpsc::channel(1);
        let message_handler = ChunkedMessageHandler {
            incoming_response_tx,
        };
        let peer = Url::from_str("ws://127.0.0.1:1/1").unwrap();
        let request_message = serialize_request_message(ChunkRequest {
            content_id: Bytes::from_static(b"content"),
            offset: 0,
            length: 8,
            slot: 0,
            respond_to_url: "ws://127.0.0.1:1/1".into(),
            respond_to_module: "ChunkResp/1".into(),
        });

        message_handler
            .recv_module_msg(peer, "ChunkResp/1".to_string(), request_message)
            .unwrap_err();
    }

    #[tokio::test]
    async fn response_forwarded_to_queue() {
        let (incoming_response_tx, mut incoming_response_rx) =
            tokio::sync::mpsc::channel(1);
        let message_handler = ChunkedMessageHandler {
            incoming_response_tx,
        };
        let peer = Url::from_str("ws://127.0.0.1:1/1").unwrap();
        let response = ChunkResponse {
            content_id: Bytes::from_static(b"content"),
            offset: 100,
            length: 5,
            slot: 1,
            eof: false,
            data: Bytes::from_static(b"hello"),
        };

        message_handler
            .recv_module_msg(
                peer,
                "ChunkResp/1".to_string(),
                serialize_response_message(response.clone()),
            )
            .unwrap();

        let got = incoming_response_rx.recv().await.unwrap();
        assert_eq!(response, got);
    }

    #[test]
    fn full_queue_is_an_error() {
        let (incoming_response_tx, _keep) = tokio::sync::mpsc::channel(1);
        let message_handler = ChunkedMessageHandler {
            incoming_response_tx,
        };
        let peer = Url::from_str("ws://127.0.0.1:1/1").unwrap();
        let response = ChunkResponse {
            content_id: Bytes::from_static(b"content"),
            offset: 0,
            length: 1,
            slot: 0,
            eof: false,
            data: Bytes::from_static(b"x"),
        };
        let enc = serialize_response_message(response);

        message_handler
            .recv_module_msg(peer.clone(), "ChunkResp/1".to_string(), enc.clone())
            .unwrap();
        // Queue capacity is 1; the second message cannot be enqueued.
        message_handler
            .recv_module_msg(peer, "ChunkResp/1".to_string(), enc)
            .unwrap_err();
    }
}
