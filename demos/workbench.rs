//! A dialer announces an incoming call; the agent workbench locks the
//! customer and runs a risk check, both answered by handlers inside the
//! broker.
use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use switchboard::*;
use tokio::{sync::mpsc, time::sleep};

const POLICY: &str = r#"{
    "domains": {
        "call": { "types": ["CALL_START", "CALL_END"] },
        "crm": { "types": ["LOCK_CUSTOMER"] },
        "risk": { "types": ["RISK_CHECK"] }
    },
    "types": {
        "CALL_START": { "sources": ["dialer"], "targets": ["workbench"] },
        "RISK_CHECK": { "sources": ["workbench", "main"] }
    }
}"#;

#[derive(Debug, Serialize, Deserialize, Message)]
#[message(event = "CALL_START", domain = "call")]
#[serde(rename_all = "camelCase")]
struct CallStart {
    caller: String,
    customer_id: String,
    amount: u64,
}

#[derive(Debug, Serialize, Deserialize, Message)]
#[message(event = "LOCK_CUSTOMER", domain = "crm", response = Locked)]
#[serde(rename_all = "camelCase")]
struct LockCustomer {
    customer_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Locked {
    locked: bool,
    customer_id: String,
}

#[derive(Debug, Serialize, Deserialize, Message)]
#[message(event = "RISK_CHECK", domain = "risk", response = RiskVerdict)]
#[serde(rename_all = "camelCase")]
struct RiskCheck {
    customer_id: String,
    amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RiskVerdict {
    passed: bool,
    score: u8,
    amount: u64,
}

impl RiskVerdict {
    fn assess(amount: u64) -> Self {
        let score = (100.0 - amount as f64 / 150.0).round().clamp(0.0, 100.0) as u8;
        RiskVerdict {
            passed: amount <= 10_000,
            score,
            amount,
        }
    }
}

/// Answer `request` from the broker after `delay`.
fn reply_later<P: Serialize + Send + 'static>(
    broker: &Broker,
    request: &Envelope,
    delay: Duration,
    payload: P,
) {
    let broker = broker.clone();
    let request = request.clone();
    tokio::spawn(async move {
        sleep(delay).await;
        if let Err(e) = broker.respond(&request, payload) {
            tracing::warn!(id = %request.id, error = %e, "reply failed");
        }
    });
}

fn install_services(broker: &Broker) {
    let b = broker.clone();
    broker.on(
        LockCustomer::TYPE,
        Handler::typed(move |lock: LockCustomer, request| {
            let locked = Locked {
                locked: true,
                customer_id: lock.customer_id,
            };
            reply_later(&b, request, Duration::from_millis(200), locked);
            Ok(())
        }),
    );

    let b = broker.clone();
    let cache: Arc<Mutex<HashMap<String, RiskVerdict>>> = Arc::default();
    broker.on(
        RiskCheck::TYPE,
        Handler::typed(move |check: RiskCheck, request| {
            let key = format!("{}:{}", check.customer_id, check.amount);
            let verdict = cache
                .lock()
                .entry(key)
                .or_insert_with(|| RiskVerdict::assess(check.amount))
                .clone();
            reply_later(&b, request, Duration::from_millis(300), verdict);
            Ok(())
        }),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let audit = JsonlAudit::new(std::env::temp_dir().join("switchboard-demo"))?
        .with_domains(["crm", "risk", "ticket"]);
    let broker = Broker::builder()
        .config(Config::default().with_default_timeout(Duration::from_secs(2)))
        .policy(RoutingPolicy::from_json(POLICY)?)
        .audit(audit)
        .build();
    broker.start()?;
    install_services(&broker);

    let workbench = Client::new("workbench", broker.connect("workbench"));
    let dialer = Client::new("dialer", broker.connect("dialer"));

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let agent = workbench.downgrade();
    workbench.on(
        CallStart::TYPE,
        Handler::typed(move |call: CallStart, _| {
            println!("Incoming call from {}", call.caller);
            let Some(agent) = agent.upgrade() else {
                return Ok(());
            };
            let done = done_tx.clone();
            tokio::spawn(async move {
                let lock = LockCustomer {
                    customer_id: call.customer_id.clone(),
                };
                let check = RiskCheck {
                    customer_id: call.customer_id,
                    amount: call.amount,
                };
                let options = RequestOptions::default();
                let locked = agent.request_typed(&lock, None, options).await;
                let verdict = agent.request_typed(&check, None, options).await;
                let _ = done.send((locked, verdict));
            });
            Ok(())
        }),
    )?;

    for (caller, customer_id, amount) in [("10086", "C-001", 5000), ("95555", "C-002", 20_000)] {
        let call = CallStart {
            caller: caller.into(),
            customer_id: customer_id.into(),
            amount,
        };
        dialer.emit(Draft::message(&call)?.to("workbench"))?;

        match done_rx.recv().await {
            Some((Ok(locked), Ok(verdict))) => println!(
                "{}: locked={} passed={} score={}",
                locked.customer_id, locked.locked, verdict.passed, verdict.score
            ),
            Some((locked, verdict)) => println!("Call failed: {locked:?} / {verdict:?}"),
            None => break,
        }
    }

    // Clients can't impersonate each other: the broker stamps the bound identity
    let receipt = workbench
        .ack(Draft::message(&CallStart {
            caller: "spoof".into(),
            customer_id: "C-003".into(),
            amount: 0,
        })?)
        .await?;
    println!("Spoofed call accepted? {}", receipt.is_accepted());

    broker.shutdown();
    Ok(())
}
