//! Two replicas over real WebSocket loopback sockets.

use std::sync::Arc;

use meshpad::transport::ws::WsTransport;
use meshpad::{DocumentHost, Mesh, MeshConfig, MeshEvent, MeshHandle, PeerAddr, SharedDocument};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

async fn spawn_ws_peer(
    bootstrap: Option<PeerAddr>,
) -> (
    PeerAddr,
    MeshHandle,
    mpsc::Receiver<MeshEvent>,
    SharedDocument,
) {
    let (net_tx, net_rx) = mpsc::channel(256);
    let transport = WsTransport::bind("127.0.0.1:0", net_tx).await.unwrap();
    let addr = transport.local_addr().clone();
    let doc = SharedDocument::new();
    let (handle, events) = Mesh::spawn(
        MeshConfig::new(addr.clone()),
        Arc::new(transport),
        Box::new(doc.clone()),
        net_rx,
        bootstrap,
    );
    (addr, handle, events, doc)
}

async fn wait_synced(events: &mut mpsc::Receiver<MeshEvent>) {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(MeshEvent::Synced) => break,
                Some(_) => continue,
                None => panic!("event stream ended before sync"),
            }
        }
    })
    .await
    .expect("timed out waiting for sync");
}

async fn wait_doc(doc: &SharedDocument, expected: &str) {
    let deadline = timeout(Duration::from_secs(5), async {
        while doc.text() != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        deadline.is_ok(),
        "document never converged: got {:?}, expected {expected:?}",
        doc.text()
    );
}

#[tokio::test]
async fn test_edits_propagate_over_websocket() {
    let (a_addr, a_handle, _a_events, a_doc) = spawn_ws_peer(None).await;
    let (_b_addr, b_handle, mut b_events, b_doc) = spawn_ws_peer(Some(a_addr)).await;
    wait_synced(&mut b_events).await;

    let mut b_doc_writer = b_doc.clone();
    b_doc_writer.insert(0, "over the wire");
    b_handle.submit_insert(0, "over the wire").await.unwrap();
    wait_doc(&a_doc, "over the wire").await;

    let mut a_doc_writer = a_doc.clone();
    a_doc_writer.delete(0, 5);
    a_handle.submit_delete(0, 5).await.unwrap();
    wait_doc(&b_doc, "the wire").await;

    let a_stats = a_handle.stats().await.unwrap();
    assert!(a_stats.degree >= 1);
    assert_eq!(a_stats.view_len, 1);
}

#[tokio::test]
async fn test_snapshot_over_websocket() {
    let (net_tx, net_rx) = mpsc::channel(256);
    let transport = WsTransport::bind("127.0.0.1:0", net_tx).await.unwrap();
    let a_addr = transport.local_addr().clone();
    let doc = SharedDocument::with_text("served over ws");
    let (_a_handle, _a_events) = Mesh::spawn(
        MeshConfig::new(a_addr.clone()),
        Arc::new(transport),
        Box::new(doc.clone()),
        net_rx,
        None,
    );

    let (_b_addr, _b_handle, mut b_events, b_doc) = spawn_ws_peer(Some(a_addr)).await;
    wait_synced(&mut b_events).await;
    assert_eq!(b_doc.text(), "served over ws");
}
