//! Clients talking to a broker over in-process transports.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde_json::json;
use switchboard::{
    BROADCAST, Broker, Client, Draft, Envelope, Handler, LocalTransport, RequestOptions,
    RoutingPolicy,
};
use tokio::sync::mpsc::unbounded_channel;

fn policy() -> RoutingPolicy {
    RoutingPolicy::new()
        .allow("call", ["CALL_START", "CALL_END"])
        .allow("crm", ["LOCK_CUSTOMER"])
        .allow("demo", ["BROADCAST", "PING"])
        .restrict_sources("CALL_START", ["dialer"])
        .restrict_targets("CALL_START", ["workbench"])
}

fn client(broker: &Broker, identity: &str) -> Client<LocalTransport> {
    Client::new(identity, broker.connect(identity))
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_targeted_event_reaches_handler() {
    let broker = Broker::new(policy());
    let workbench = client(&broker, "workbench");
    let dialer = client(&broker, "dialer");

    let (tx, mut rx) = unbounded_channel();
    workbench
        .on(
            "CALL_START",
            Handler::new(move |envelope| {
                let _ = tx.send(envelope.clone());
                Ok(())
            }),
        )
        .unwrap();

    dialer
        .emit(
            Draft::new("CALL_START", "call")
                .to("workbench")
                .with_payload(json!({"caller": "10086"})),
        )
        .unwrap();

    let envelope = rx.recv().await.unwrap();
    assert_eq!(envelope.source, "dialer");
    assert_eq!(envelope.payload["caller"], "10086");
    broker.shutdown();
}

#[tokio::test]
async fn test_unauthorized_source_is_rejected() {
    let broker = Broker::new(policy());
    let workbench = client(&broker, "workbench");
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    workbench
        .on(
            "CALL_START",
            Handler::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

    // A client can't pose as the dialer: the broker stamps the bound identity
    let renderer = client(&broker, "renderer");
    let receipt = renderer
        .ack(Draft::new("CALL_START", "call").to("workbench"))
        .await
        .unwrap();
    assert!(!receipt.is_accepted());
    assert!(receipt.error.unwrap().contains("renderer"));

    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_broadcast_reaches_every_context() {
    let broker = Broker::new(policy());
    let contexts: Vec<_> = ["workbench", "dialer", "renderer"]
        .into_iter()
        .map(|identity| client(&broker, identity))
        .collect();

    let (tx, mut rx) = unbounded_channel();
    for context in &contexts {
        let tx = tx.clone();
        let identity = context.identity().to_owned();
        context
            .on(
                "BROADCAST",
                Handler::new(move |_| {
                    let _ = tx.send(identity.clone());
                    Ok(())
                }),
            )
            .unwrap();
    }
    drop(tx);

    let receipt = contexts[2]
        .ack(Draft::new("BROADCAST", "demo").to(BROADCAST))
        .await
        .unwrap();
    assert!(receipt.is_accepted());

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(rx.recv().await.unwrap());
    }
    seen.sort();
    // The sender receives its own broadcast too
    assert_eq!(seen, vec!["dialer", "renderer", "workbench"]);
    broker.shutdown();
}

#[tokio::test]
async fn test_client_answers_request() {
    let broker = Broker::new(policy());
    let crm = client(&broker, "crm");
    let workbench = client(&broker, "workbench");

    let responder = crm.downgrade();
    crm.on(
        "LOCK_CUSTOMER",
        Handler::new(move |request| {
            let customer = request.payload["customerId"].clone();
            responder.respond(request, json!({"locked": true, "customerId": customer}))
        }),
    )
    .unwrap();

    let outcome = workbench
        .request(
            Draft::new("LOCK_CUSTOMER", "crm")
                .to("crm")
                .with_payload(json!({"customerId": "C-001"})),
            RequestOptions::default().with_timeout(Duration::from_secs(2)),
        )
        .await;

    assert!(outcome.ok);
    assert_eq!(outcome.data.unwrap()["customerId"], "C-001");
    assert_eq!(broker.pending_count(), 0);
    broker.shutdown();
}

#[tokio::test]
async fn test_responding_client_is_forgotten_once_dropped() {
    let broker = Broker::new(policy());
    let workbench = client(&broker, "workbench");
    let crm = client(&broker, "crm");
    let responder = crm.downgrade();
    crm.on(
        "LOCK_CUSTOMER",
        Handler::new(move |request| responder.respond(request, json!({"locked": true}))),
    )
    .unwrap();

    let options = RequestOptions::default().with_timeout(Duration::from_secs(2));
    let outcome = workbench
        .request(Draft::new("LOCK_CUSTOMER", "crm").to("crm"), options)
        .await;
    assert!(outcome.ok);

    drop(crm);
    for _ in 0..200 {
        if broker.target_names() == vec!["workbench"] {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(broker.target_names(), vec!["workbench"]);
    broker.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out_over_transport() {
    let broker = Broker::new(policy());
    let workbench = client(&broker, "workbench");

    let outcome = workbench
        .request(
            Draft::new("LOCK_CUSTOMER", "crm").to("main"),
            RequestOptions::default().with_timeout(Duration::from_millis(250)),
        )
        .await;
    assert!(outcome.is_timeout());
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test]
async fn test_once_and_off() {
    let broker = Broker::new(policy());
    let workbench = client(&broker, "workbench");
    let dialer = client(&broker, "dialer");

    let ends = Arc::new(AtomicUsize::new(0));
    let e = ends.clone();
    workbench
        .once(
            "CALL_END",
            Handler::new(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

    let starts = Arc::new(AtomicUsize::new(0));
    let s = starts.clone();
    let on_start = Handler::new(move |_| {
        s.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let subscription = workbench.on("CALL_START", on_start).unwrap();

    for _ in 0..2 {
        dialer
            .ack(Draft::new("CALL_END", "call").to("workbench"))
            .await
            .unwrap();
    }
    dialer
        .ack(Draft::new("CALL_START", "call").to("workbench"))
        .await
        .unwrap();
    settle().await;

    subscription.unsubscribe();
    dialer
        .ack(Draft::new("CALL_START", "call").to("workbench"))
        .await
        .unwrap();
    settle().await;

    assert_eq!(ends.load(Ordering::SeqCst), 1);
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(workbench.handler_count("CALL_END"), 0);
    broker.shutdown();
}

#[tokio::test]
async fn test_policy_reload_applies_to_next_envelope() {
    let broker = Broker::new(policy());
    let renderer = client(&broker, "renderer");

    let receipt = renderer
        .ack(Draft::new("TICKET_DONE", "ticket"))
        .await
        .unwrap();
    assert!(!receipt.is_accepted());

    broker
        .policy()
        .reload_from_str(r#"{ "domains": { "ticket": { "types": ["TICKET_DONE"] } } }"#)
        .unwrap();

    let receipt = renderer
        .ack(Draft::new("TICKET_DONE", "ticket"))
        .await
        .unwrap();
    assert!(receipt.is_accepted());
    broker.shutdown();
}

#[tokio::test]
async fn test_dropped_client_is_forgotten() {
    let broker = Broker::new(policy());
    let dialer = client(&broker, "dialer");
    {
        let _workbench = client(&broker, "workbench");
        assert_eq!(broker.target_names(), vec!["dialer", "workbench"]);
    }
    for _ in 0..100 {
        if broker.target_names().len() == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(broker.target_names(), vec!["dialer"]);

    // Forwarding to a context that is gone is dropped silently
    let receipt = dialer
        .ack(Draft::new("CALL_START", "call").to("workbench"))
        .await
        .unwrap();
    assert!(receipt.is_accepted());
    assert!(
        broker
            .emit(Envelope::new("PING", "demo", "main").to("dialer"))
            .is_ok()
    );
    broker.shutdown();
}
