//! Session walkthrough against an in-process server
//!
//! Connects a session over memory links, logs in, runs a mutation with a
//! side-effect query and a streamed field, and listens to a topic.
//!
//! Run: RUST_LOG=seam_client=debug cargo run --example session_demo

use anyhow::Context;
use seam_client::{
    AuthExtension, Endpoint, Envelope, MemoryServer, Mutation, Session, SessionConfig,
    SideEffectQuery, TransportKind,
};
use serde_json::{Value, json};
use shared::message::{
    AUTH_LOGIN, AUTH_SUCCESS, CALL, SUBSCRIBE_TO_TOPIC, publication_event, response_event,
    stream_event, subscription_result_event,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

struct OrderList;

impl SideEffectQuery for OrderList {
    fn endpoint(&self) -> &str {
        "orders.list"
    }

    fn params(&self) -> Value {
        json!({"open": true})
    }

    fn apply_side_effect_result(&self, result: Value) {
        println!("📋 orders.list refreshed: {}", result);
    }
}

/// Answer whatever the client sent since the last round
fn serve(server: &MemoryServer, handled: &mut usize) {
    let frames = server.frames();
    let Some(link) = server.latest() else {
        return;
    };
    for frame in frames.iter().skip(*handled) {
        match frame.event.as_str() {
            AUTH_LOGIN => link.deliver(&Envelope::new(AUTH_SUCCESS, json!({"user": "demo"}))),
            SUBSCRIBE_TO_TOPIC => {
                let topic = frame.data["topic"].as_str().unwrap_or_default();
                link.deliver(&Envelope::new(subscription_result_event(topic), json!(true)));
                link.deliver(&Envelope::new(publication_event(topic), json!({"orderId": 1, "status": "open"})));
            }
            CALL => {
                let call_id = frame.data["callId"].as_str().unwrap_or_default();
                link.deliver(&Envelope::new(
                    stream_event(call_id, "progress"),
                    json!({"backlog": ["accepted", "cooking"], "ended": false}),
                ));
                link.deliver(&Envelope::new(
                    response_event(call_id),
                    json!({
                        "mutationResult": {"orderId": 2, "progress": {"__moopsyStream": "progress"}},
                        "sideEffectResults": [{"sideEffectId": 0, "result": [{"orderId": 1}, {"orderId": 2}]}]
                    }),
                ));
                link.deliver(&Envelope::new(
                    stream_event(call_id, "progress"),
                    json!({"backlog": ["served"], "ended": true}),
                ));
            }
            _ => {}
        }
    }
    *handled = frames.len();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("seam_client=info")),
        )
        .init();

    println!("\n🔌 Seam session demo");
    println!("====================\n");

    let server = MemoryServer::new();
    tokio::spawn({
        let server = server.clone();
        async move {
            let mut handled = 0;
            loop {
                serve(&server, &mut handled);
                let seen = handled;
                server.wait_for(|s| s.frames().len() > seen).await;
            }
        }
    });

    let session = Session::builder(SessionConfig::new("mem://demo"))
        .connector(Arc::new(server.connector(TransportKind::Socket)))
        .connector(Arc::new(server.connector(TransportKind::Http)))
        .probe(Arc::new(server.clone()))
        .build()?;
    let auth = AuthExtension::install(&session, None);

    session.connect()?;
    session.await_connected().await?;
    println!("✅ Connected over {}", session.kind());

    auth.login(json!({"username": "demo", "password": "demo"}))
        .await
        .context("login failed")?;
    println!("🔑 Logged in: {:?}", auth.current_auth());

    let subscription = session.subscribe_topic("orders", "store-1", json!({}))?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _listener = subscription.listen(move |data| {
        let _ = tx.send(data.clone());
    })?;
    match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(publication)) => println!("📣 orders: {}", publication),
        _ => println!("📣 orders: no publication yet"),
    }

    let create = Mutation::new(&session, Endpoint::new("orders.create"))
        .with_side_effects(vec![Some(Arc::new(OrderList) as Arc<dyn SideEffectQuery>)]);
    let mut output = create.call(json!({"table": 4})).await?;
    println!("🧾 orders.create -> {}", output.value);

    if let Some(progress) = output.take_stream("progress") {
        for step in progress.collect().await {
            println!("   progress: {}", step);
        }
    }

    session.close();
    println!("\n👋 Session closed");
    Ok(())
}
