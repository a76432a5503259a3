//! One-shot publisher flows against an in-process relay stub.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nostr::{EventBuilder, Keys};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use owlery_relay::{Error, LocalSigner, OneShotPublisher, PublishOutcome};

async fn bind_stub() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());
    (listener, url)
}

#[tokio::test]
async fn publish_resolves_on_ok() {
    let (listener, url) = bind_stub().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("expected EVENT frame");
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(frame[0], "EVENT");
        let id = frame[1]["id"].as_str().unwrap().to_string();
        ws.send(Message::Text(format!(r#"["OK","{id}",true,""]"#).into()))
            .await
            .unwrap();
    });

    let keys = Keys::generate();
    let event = EventBuilder::text_note("one shot").sign_with_keys(&keys).unwrap();
    let publisher = OneShotPublisher::new(&url, Arc::new(LocalSigner::new(keys))).unwrap();

    let outcome = publisher.publish(&event).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Acknowledged);
    server.await.unwrap();
}

#[tokio::test]
async fn publish_authenticates_and_retries_once() {
    let (listener, url) = bind_stub().await;

    // Relay stub: reject the first EVENT with auth-required, challenge,
    // accept the auth, then accept the resent event. Returns how many
    // EVENT frames were seen for the published id.
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut event_frames = 0usize;

        // First EVENT: auth-required.
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("expected EVENT frame");
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(frame[0], "EVENT");
        let event_id = frame[1]["id"].as_str().unwrap().to_string();
        event_frames += 1;
        ws.send(Message::Text(
            format!(r#"["OK","{event_id}",false,"auth-required: please auth"]"#).into(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(r#"["AUTH","chal42"]"#.to_string().into()))
            .await
            .unwrap();

        // AUTH response.
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("expected AUTH frame");
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(frame[0], "AUTH");
        assert_eq!(frame[1]["kind"], 22242);
        let auth_id = frame[1]["id"].as_str().unwrap().to_string();
        ws.send(Message::Text(format!(r#"["OK","{auth_id}",true,""]"#).into()))
            .await
            .unwrap();

        // Resent EVENT: accept.
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("expected resent EVENT frame");
        };
        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(frame[0], "EVENT");
        assert_eq!(frame[1]["id"].as_str().unwrap(), event_id);
        event_frames += 1;
        ws.send(Message::Text(format!(r#"["OK","{event_id}",true,""]"#).into()))
            .await
            .unwrap();

        event_frames
    });

    let keys = Keys::generate();
    let event = EventBuilder::text_note("needs auth").sign_with_keys(&keys).unwrap();
    let publisher = OneShotPublisher::new(&url, Arc::new(LocalSigner::new(keys))).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), publisher.publish(&event))
        .await
        .expect("publish timed out")
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Acknowledged);

    // Exactly two EVENT frames for the same id: original + one retry.
    assert_eq!(server.await.unwrap(), 2);
}

#[tokio::test]
async fn publish_cancellation_resolves_without_error() {
    let (listener, url) = bind_stub().await;

    // Relay stub that accepts the socket and never acknowledges.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let keys = Keys::generate();
    let event = EventBuilder::text_note("never acked").sign_with_keys(&keys).unwrap();
    let publisher = OneShotPublisher::new(&url, Arc::new(LocalSigner::new(keys))).unwrap();

    let cancel = CancellationToken::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
    });

    let outcome = publisher.publish_cancellable(&event, cancel).await.unwrap();
    assert_eq!(outcome, PublishOutcome::Cancelled);
}

#[tokio::test]
async fn publish_times_out_without_ok() {
    let (listener, url) = bind_stub().await;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let keys = Keys::generate();
    let event = EventBuilder::text_note("silence").sign_with_keys(&keys).unwrap();
    let publisher = OneShotPublisher::new(&url, Arc::new(LocalSigner::new(keys)))
        .unwrap()
        .with_timeout(Duration::from_millis(300));

    let result = publisher.publish(&event).await;
    assert!(matches!(result, Err(Error::Timeout)));
}
