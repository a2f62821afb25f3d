use ferry_api::{transfer::*, ContentId, FerryError, Url};
use ferry_core::{
    default_builder,
    factories::{
        core_chunked::config::{CoreChunkedConfig, CoreChunkedModConfig},
        ContentServer, MemContentSource,
    },
    FerryNode,
};
use ferry_test_utils::{enable_tracing, id::random_content_id, random_bytes};
use std::sync::Arc;
use std::time::Duration;

fn fast_chunked_config() -> CoreChunkedModConfig {
    CoreChunkedModConfig {
        core_chunked: CoreChunkedConfig {
            max_request_bytes: 512,
            health_check_interval_ms: 25,
            response_timeout_ms: 100,
            stall_timeout_ms: 400,
            ..Default::default()
        },
    }
}

struct Peer {
    node: Arc<FerryNode>,
    source: Arc<MemContentSource>,
    _server: Option<Arc<ContentServer>>,
}

async fn make_peer(serve: bool) -> Peer {
    let builder =
        Arc::new(default_builder().with_default_config().unwrap());
    builder
        .config
        .set_module_config(&fast_chunked_config())
        .unwrap();
    let node = FerryNode::create(builder).await.unwrap();
    let source = MemContentSource::create();
    let server = if serve {
        Some(node.serve(source.clone()).unwrap())
    } else {
        None
    };
    Peer {
        node,
        source,
        _server: server,
    }
}

fn descriptor(content_id: &ContentId, sources: Vec<Url>) -> ContentRef {
    ContentRef::Descriptor(ContentDescriptor {
        content_id: content_id.clone(),
        sources,
        mime_type: Some("application/octet-stream".into()),
        length: None,
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn two_peer_transfer() {
    enable_tracing();
    let content_id = random_content_id();
    let data = random_bytes(8192);

    let bob = make_peer(true).await;
    bob.source.insert(
        content_id.clone(),
        bytes::Bytes::from(data.clone()),
        "application/octet-stream".into(),
    );

    let alice = make_peer(false).await;
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("retrieved.bin");

    let transfer = alice
        .node
        .retrieve(descriptor(
            &content_id,
            vec![bob.node.url().unwrap()],
        ))
        .await
        .unwrap();
    transfer.start_transfer(dest.clone()).unwrap();

    let content = transfer
        .wait_for(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(content_id, content.content_id);
    assert_eq!(data.len() as u64, content.length);
    assert_eq!(data, std::fs::read(&dest).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn two_contents_transfer_concurrently() {
    enable_tracing();
    let content_a = random_content_id();
    let content_b = random_content_id();
    let data_a = random_bytes(4096);
    let data_b = random_bytes(4096);

    let bob = make_peer(true).await;
    bob.source.insert(
        content_a.clone(),
        bytes::Bytes::from(data_a.clone()),
        "application/octet-stream".into(),
    );
    bob.source.insert(
        content_b.clone(),
        bytes::Bytes::from(data_b.clone()),
        "application/octet-stream".into(),
    );

    let alice = make_peer(false).await;
    let dir = tempfile::TempDir::new().unwrap();

    let mut transfers = Vec::new();
    for (content_id, name) in
        [(&content_a, "a.bin"), (&content_b, "b.bin")]
    {
        let transfer = alice
            .node
            .retrieve(descriptor(
                content_id,
                vec![bob.node.url().unwrap()],
            ))
            .await
            .unwrap();
        transfer.start_transfer(dir.path().join(name)).unwrap();
        transfers.push(transfer);
    }

    let results = futures::future::join_all(
        transfers
            .iter()
            .map(|t| t.wait_for(Some(Duration::from_secs(5)))),
    )
    .await;
    for result in results {
        result.unwrap();
    }

    assert_eq!(data_a, std::fs::read(dir.path().join("a.bin")).unwrap());
    assert_eq!(data_b, std::fs::read(dir.path().join("b.bin")).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn failover_past_unreachable_sources() {
    enable_tracing();
    let content_id = random_content_id();
    let data = random_bytes(2048);

    let bob = make_peer(true).await;
    bob.source.insert(
        content_id.clone(),
        bytes::Bytes::from(data.clone()),
        "application/octet-stream".into(),
    );

    let alice = make_peer(false).await;
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("retrieved.bin");

    // Two descriptors that cannot be reached, then the live one.
    let dead_1 = Url::from_str("ws://mem.pipe:42/777000001").unwrap();
    let dead_2 = Url::from_str("ws://mem.pipe:42/777000002").unwrap();

    let transfer = alice
        .node
        .retrieve(descriptor(
            &content_id,
            vec![dead_1, dead_2, bob.node.url().unwrap()],
        ))
        .await
        .unwrap();
    transfer.start_transfer(dest.clone()).unwrap();

    let content = transfer
        .wait_for(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(data.len() as u64, content.length);
    assert_eq!(data, std::fs::read(&dest).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn stalled_source_falls_back_to_live_one() {
    enable_tracing();
    let content_id = random_content_id();
    let data = random_bytes(2048);

    // Carol is reachable but never answers: her node serves nothing.
    let carol = make_peer(false).await;

    let bob = make_peer(true).await;
    bob.source.insert(
        content_id.clone(),
        bytes::Bytes::from(data.clone()),
        "application/octet-stream".into(),
    );

    let alice = make_peer(false).await;
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("retrieved.bin");

    let transfer = alice
        .node
        .retrieve(descriptor(
            &content_id,
            vec![carol.node.url().unwrap(), bob.node.url().unwrap()],
        ))
        .await
        .unwrap();
    transfer.start_transfer(dest.clone()).unwrap();

    // The silent source must burn its stall timeout first.
    let content = transfer
        .wait_for(Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(data, std::fs::read(&dest).unwrap());
    assert_eq!(TransferState::Completed, transfer.state());
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausting_every_source_fails_the_aggregate() {
    enable_tracing();
    let content_id = random_content_id();

    let alice = make_peer(false).await;
    let dir = tempfile::TempDir::new().unwrap();

    let dead_1 = Url::from_str("ws://mem.pipe:42/777000003").unwrap();
    let dead_2 = Url::from_str("ws://mem.pipe:42/777000004").unwrap();

    let transfer = alice
        .node
        .retrieve(descriptor(&content_id, vec![dead_1, dead_2]))
        .await
        .unwrap();
    transfer
        .start_transfer(dir.path().join("out.bin"))
        .unwrap();

    let err = transfer
        .wait_for(Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert_eq!(TransferState::Failed, transfer.state());
    assert!(err.is_stalled());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_aggregate_reports_cancelled() {
    enable_tracing();
    let content_id = random_content_id();

    // A reachable but silent source keeps the transfer in flight.
    let carol = make_peer(false).await;
    let alice = make_peer(false).await;
    let dir = tempfile::TempDir::new().unwrap();

    let transfer = alice
        .node
        .retrieve(descriptor(
            &content_id,
            vec![carol.node.url().unwrap()],
        ))
        .await
        .unwrap();
    transfer
        .start_transfer(dir.path().join("out.bin"))
        .unwrap();

    transfer.cancel();
    let err = transfer
        .wait_for(Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, FerryError::Cancelled));
    assert_eq!(TransferState::Cancelled, transfer.state());
}
