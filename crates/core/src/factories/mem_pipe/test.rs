use crate::default_builder;
use ferry_api::{pipe::*, protocol::*, *};
use std::sync::{Arc, Mutex};

async fn make_pipe() -> DynPipe {
    let builder =
        Arc::new(default_builder().with_default_config().unwrap());
    builder.pipe.create(builder.clone()).await.unwrap()
}

#[derive(Debug)]
struct RecordHandler {
    got: Arc<Mutex<Vec<(Url, String, bytes::Bytes)>>>,
}

impl PipeModuleHandler for RecordHandler {
    fn recv_module_msg(
        &self,
        peer: Url,
        module: String,
        data: bytes::Bytes,
    ) -> FerryResult<()> {
        self.got.lock().unwrap().push((peer, module, data));
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn two_pipe_send_recv() {
    let a = make_pipe().await;
    let b = make_pipe().await;

    let got = Arc::new(Mutex::new(Vec::new()));
    b.register_module_handler(
        "TestMod".into(),
        Arc::new(RecordHandler { got: got.clone() }),
    );

    a.send_module(
        b.url().unwrap(),
        "TestMod".into(),
        bytes::Bytes::from_static(b"hello"),
    )
    .await
    .unwrap();

    ferry_test_utils::iter_check!({
        if !got.lock().unwrap().is_empty() {
            break;
        }
    });

    let (peer, module, data) = got.lock().unwrap().remove(0);
    assert_eq!(a.url().unwrap(), peer);
    assert_eq!("TestMod", module);
    assert_eq!(bytes::Bytes::from_static(b"hello"), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn send_to_unknown_peer_errors() {
    let a = make_pipe().await;
    let gone = Url::from_str("ws://mem.pipe:42/999999999").unwrap();
    a.send_module(gone, "TestMod".into(), bytes::Bytes::from_static(b"x"))
        .await
        .unwrap_err();
}

#[tokio::test(flavor = "multi_thread")]
async fn unregistered_module_messages_are_dropped() {
    let a = make_pipe().await;
    let b = make_pipe().await;

    let got = Arc::new(Mutex::new(Vec::new()));
    b.register_module_handler(
        "TestMod".into(),
        Arc::new(RecordHandler { got: got.clone() }),
    );
    b.unregister_module_handler("TestMod");

    // The frame is accepted by the channel but never dispatched.
    a.send_module(
        b.url().unwrap(),
        "TestMod".into(),
        bytes::Bytes::from_static(b"dropped"),
    )
    .await
    .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert!(got.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn envelope_round_trip_through_pipe() {
    let a = make_pipe().await;
    let b = make_pipe().await;

    let got = Arc::new(Mutex::new(Vec::new()));
    b.register_module_handler(
        "ChunkMod".into(),
        Arc::new(RecordHandler { got: got.clone() }),
    );

    let request = ChunkRequest {
        content_id: bytes::Bytes::from_static(b"content"),
        offset: 0,
        length: 1024,
        slot: 0,
        respond_to_url: a.url().unwrap().as_str().into(),
        respond_to_module: "Inbox/1".into(),
    };
    a.send_module(
        b.url().unwrap(),
        "ChunkMod".into(),
        serialize_request_message(request.clone()),
    )
    .await
    .unwrap();

    ferry_test_utils::iter_check!({
        if !got.lock().unwrap().is_empty() {
            break;
        }
    });

    let (_, _, data) = got.lock().unwrap().remove(0);
    let msg = <ChunkMessage as prost::Message>::decode(data).unwrap();
    let dec =
        <ChunkRequest as prost::Message>::decode(msg.data).unwrap();
    assert_eq!(request, dec);
}
