// seam-client/tests/mutations.rs
// 变更编排集成测试

mod common;

use serde_json::{Value, json};
use seam_client::{
    ClientError, Endpoint, Envelope, MemoryServer, Mutation, MutationError, RpcError,
    SideEffectQuery,
};
use shared::message::{CALL, response_event, stream_event};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingQuery {
    results: Mutex<Vec<Value>>,
}

impl SideEffectQuery for RecordingQuery {
    fn endpoint(&self) -> &str {
        "orders.list"
    }

    fn params(&self) -> Value {
        json!({"page": 1})
    }

    fn apply_side_effect_result(&self, result: Value) {
        self.results.lock().unwrap().push(result);
    }
}

async fn sent_call_id(server: &MemoryServer, calls: usize) -> String {
    server.wait_for(|s| s.count(CALL) == calls).await;
    server.frames_for(CALL)[calls - 1].data["callId"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test(start_paused = true)]
async fn test_side_effects_and_streams_are_unwrapped() {
    let server = MemoryServer::new();
    let session = common::connected(&server).await;
    let query = Arc::new(RecordingQuery::default());

    let mutation = Arc::new(
        Mutation::new(&session, Endpoint::public("orders.create"))
            .with_side_effects(vec![None, Some(query.clone() as Arc<dyn SideEffectQuery>)]),
    );
    let mut changes = mutation.changes();

    let running = tokio::spawn({
        let mutation = mutation.clone();
        async move { mutation.call(json!({"table": 4})).await }
    });

    let call_id = sent_call_id(&server, 1).await;
    let sent = &server.frames_for(CALL)[0];
    assert_eq!(sent.data["params"], json!({"table": 4}));
    assert_eq!(
        sent.data["sideEffects"],
        json!([{"sideEffectId": 1, "method": "orders.list", "params": {"page": 1}}])
    );
    assert!(mutation.is_loading());
    assert_eq!(mutation.active_calls()[0].mutation_id, call_id);

    let link = server.latest().unwrap();
    // Chunks may arrive before the response that announces the stream
    link.deliver(&Envelope::new(
        stream_event(&call_id, "s1"),
        json!({"backlog": ["queued"], "ended": false}),
    ));
    link.deliver(&Envelope::new(
        response_event(&call_id),
        json!({
            "mutationResult": {"orderId": 12, "progress": {"__moopsyStream": "s1"}},
            "sideEffectResults": [{"sideEffectId": 1, "result": [{"orderId": 12}]}]
        }),
    ));

    let mut output = running.await.unwrap().unwrap();
    assert_eq!(output.value, json!({"orderId": 12, "progress": "s1"}));
    assert_eq!(*query.results.lock().unwrap(), vec![json!([{"orderId": 12}])]);

    let progress = output.take_stream("progress").unwrap();
    assert_eq!(progress.stream_id(), "s1");
    link.deliver(&Envelope::new(
        stream_event(&call_id, "s1"),
        json!({"backlog": ["cooking", "served"], "ended": true}),
    ));
    assert_eq!(
        progress.collect().await,
        vec![json!("queued"), json!("cooking"), json!("served")]
    );

    // One notification on start, one on the terminal outcome
    assert!(changes.recv().await.unwrap().is_loading);
    let done = changes.recv().await.unwrap();
    assert!(!done.is_loading);
    assert!(done.active_calls.is_empty());
    assert!(done.error.is_none());
    assert!(changes.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_application_error_is_stored_and_raised() {
    let server = MemoryServer::new();
    let session = common::connected(&server).await;
    let mutation = Arc::new(Mutation::new(&session, Endpoint::public("orders.void")));
    let mut changes = mutation.changes();

    let running = tokio::spawn({
        let mutation = mutation.clone();
        async move { mutation.call(json!({"orderId": 3})).await }
    });
    let call_id = sent_call_id(&server, 1).await;
    server.latest().unwrap().deliver(&Envelope::new(
        response_event(&call_id),
        RpcError::new(409, "Order already paid").to_value(),
    ));

    let err = running.await.unwrap().unwrap_err();
    let expected = MutationError::Failed {
        endpoint: "orders.void".into(),
        error: RpcError::new(409, "Order already paid"),
    };
    assert!(matches!(&err, ClientError::Mutation(e) if *e == expected));
    assert_eq!(mutation.error(), Some(expected));
    assert!(!mutation.is_loading());

    assert!(changes.recv().await.unwrap().is_loading);
    assert!(changes.recv().await.unwrap().error.is_some());
    assert!(changes.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_classified_as_timeout() {
    let server = MemoryServer::new();
    let session = common::connected(&server).await;
    let mutation = Mutation::new(&session, Endpoint::public("reports.export"))
        .with_timeout(Duration::from_secs(2));

    let err = mutation.call(json!({})).await.unwrap_err();
    let error = match err {
        ClientError::Mutation(error) => error,
        other => panic!("expected mutation error, got {:?}", other),
    };
    assert!(error.is_timeout());
    assert_eq!(error.code(), 408);
    assert_eq!(error.to_string(), "Request Timeout: reports.export");
    assert_eq!(mutation.error(), Some(error));
}

#[tokio::test(start_paused = true)]
async fn test_next_call_clears_previous_error() {
    let server = MemoryServer::new();
    let session = common::connected(&server).await;
    let mutation = Arc::new(
        Mutation::new(&session, Endpoint::public("orders.void")).with_timeout(Duration::from_secs(1)),
    );

    assert!(mutation.call(json!({})).await.is_err());
    assert!(mutation.error().is_some());

    let running = tokio::spawn({
        let mutation = mutation.clone();
        async move { mutation.call(json!({})).await }
    });
    let call_id = sent_call_id(&server, 2).await;
    assert!(mutation.error().is_none());

    server.latest().unwrap().deliver(&Envelope::new(
        response_event(&call_id),
        json!({"mutationResult": true}),
    ));
    assert_eq!(running.await.unwrap().unwrap().value, json!(true));
    assert!(mutation.error().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_query_is_dropped_not_replayed_while_offline() {
    let server = MemoryServer::new();
    let session = common::connected(&server).await;
    let gate = common::ToggleGate::logged_in();
    gate.set(false);
    session.set_auth_gate(gate.clone());

    let query = Arc::new(
        Mutation::query(&session, Endpoint::new("orders.list")).with_timeout(Duration::ZERO),
    );
    let running = tokio::spawn({
        let query = query.clone();
        async move { query.call(json!({})).await }
    });
    while session.outbox_snapshot().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!session.outbox_snapshot()[0].survives_reconnect);

    server.latest().unwrap().close(1006, "network lost");
    common::reconnected(&server, &session, 2).await;
    assert!(session.outbox_snapshot().is_empty());

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::Mutation(e) if e.code() == 1));
}
