use super::*;
use crate::default_builder;
use crate::factories::MemContentSource;
use ferry_api::{builder::Builder, pipe::DynPipe};
use ferry_test_utils::{enable_tracing, id::random_content_id, iter_check};
use std::sync::Mutex;

async fn make_pipe() -> DynPipe {
    let builder: Arc<Builder> =
        Arc::new(default_builder().with_default_config().unwrap());
    builder.pipe.create(builder.clone()).await.unwrap()
}

#[derive(Debug)]
struct InboxHandler {
    got: Arc<Mutex<Vec<ChunkResponse>>>,
}

impl PipeModuleHandler for InboxHandler {
    fn recv_module_msg(
        &self,
        _peer: Url,
        _module: String,
        data: bytes::Bytes,
    ) -> FerryResult<()> {
        use prost::Message;
        let msg = ChunkMessage::decode(data)
            .map_err(|err| FerryError::other_src("decode", err))?;
        let resp = ChunkResponse::decode(msg.data)
            .map_err(|err| FerryError::other_src("decode", err))?;
        self.got.lock().unwrap().push(resp);
        Ok(())
    }
}

struct Requester {
    pipe: DynPipe,
    inbox: String,
    got: Arc<Mutex<Vec<ChunkResponse>>>,
}

async fn make_requester(inbox: &str) -> Requester {
    let pipe = make_pipe().await;
    let got = Arc::new(Mutex::new(Vec::new()));
    pipe.register_module_handler(
        inbox.to_string(),
        Arc::new(InboxHandler { got: got.clone() }),
    );
    Requester {
        pipe,
        inbox: inbox.to_string(),
        got,
    }
}

impl Requester {
    async fn request(
        &self,
        server: &Url,
        content_id: &ContentId,
        offset: u64,
        length: u32,
        slot: u32,
    ) {
        self.pipe
            .send_module(
                server.clone(),
                crate::factories::CHUNK_REQ_MOD_NAME.to_string(),
                serialize_request_message(ChunkRequest {
                    content_id: content_id.0 .0.clone(),
                    offset,
                    length,
                    slot,
                    respond_to_url: self.pipe.url().unwrap().as_str().into(),
                    respond_to_module: self.inbox.clone(),
                }),
            )
            .await
            .unwrap();
    }
}

const DATA: &[u8] = b"the quick brown fox jumps over the lazy dog";

async fn serve_data(
    content_id: &ContentId,
) -> (Arc<ContentServer>, DynPipe, Url) {
    let pipe = make_pipe().await;
    let source = MemContentSource::create();
    source.insert(
        content_id.clone(),
        bytes::Bytes::from_static(DATA),
        "text/plain".into(),
    );
    let server = ContentServer::create(
        CoreServeConfig {
            max_read_chunk_bytes: 8,
            ..Default::default()
        },
        pipe.clone(),
        source,
    );
    let url = pipe.url().unwrap();
    (server, pipe, url)
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_requested_ranges() {
    enable_tracing();
    let content_id = random_content_id();
    let (_server, _pipe, server_url) = serve_data(&content_id).await;
    let requester = make_requester("Inbox/1").await;

    requester
        .request(&server_url, &content_id, 4, 5, 1)
        .await;

    iter_check!({
        if !requester.got.lock().unwrap().is_empty() {
            break;
        }
    });

    let resp = requester.got.lock().unwrap().remove(0);
    assert_eq!(4, resp.offset);
    assert_eq!(1, resp.slot);
    assert_eq!(5, resp.length);
    assert!(!resp.eof);
    assert_eq!(&DATA[4..9], &resp.data[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn range_past_end_gets_eof_flag() {
    enable_tracing();
    let content_id = random_content_id();
    let (_server, _pipe, server_url) = serve_data(&content_id).await;
    let requester = make_requester("Inbox/2").await;

    // 10 bytes requested where only 3 exist.
    let offset = DATA.len() as u64 - 3;
    requester
        .request(&server_url, &content_id, offset, 10, 0)
        .await;

    iter_check!({
        if !requester.got.lock().unwrap().is_empty() {
            break;
        }
    });

    let resp = requester.got.lock().unwrap().remove(0);
    assert!(resp.eof);
    assert_eq!(3, resp.length);
    assert_eq!(&DATA[DATA.len() - 3..], &resp.data[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_content_is_not_answered() {
    enable_tracing();
    let content_id = random_content_id();
    let (_server, _pipe, server_url) = serve_data(&content_id).await;
    let requester = make_requester("Inbox/3").await;

    let unknown = random_content_id();
    requester.request(&server_url, &unknown, 0, 8, 0).await;

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(requester.got.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn each_requester_gets_its_own_window() {
    enable_tracing();
    let content_id = random_content_id();
    let (_server, _pipe, server_url) = serve_data(&content_id).await;
    let a = make_requester("Inbox/4").await;
    let b = make_requester("Inbox/5").await;

    // Both requesters read from the very start of the one-shot origin;
    // each inbox is backed by its own recovery window over a fresh
    // stream.
    a.request(&server_url, &content_id, 0, 8, 0).await;
    b.request(&server_url, &content_id, 0, 8, 0).await;

    iter_check!({
        if !a.got.lock().unwrap().is_empty()
            && !b.got.lock().unwrap().is_empty()
        {
            break;
        }
    });

    assert_eq!(&DATA[0..8], &a.got.lock().unwrap()[0].data[..]);
    assert_eq!(&DATA[0..8], &b.got.lock().unwrap()[0].data[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn retried_request_served_from_window() {
    enable_tracing();
    let content_id = random_content_id();
    let (_server, _pipe, server_url) = serve_data(&content_id).await;
    let requester = make_requester("Inbox/6").await;

    // Stream forward first, then replay an older range as a retried
    // request would.
    requester
        .request(&server_url, &content_id, 0, 16, 0)
        .await;
    iter_check!({
        if !requester.got.lock().unwrap().is_empty() {
            break;
        }
    });
    requester.got.lock().unwrap().clear();

    requester
        .request(&server_url, &content_id, 2, 6, 1)
        .await;
    iter_check!({
        if !requester.got.lock().unwrap().is_empty() {
            break;
        }
    });

    let resp = requester.got.lock().unwrap().remove(0);
    assert_eq!(&DATA[2..8], &resp.data[..]);
    assert!(!resp.eof);
}
