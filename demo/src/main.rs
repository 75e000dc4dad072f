use pulse_core::event::Event;
use pulse_core::handler::handler_fn;
use pulse_macros::EventPayload;
use pulse_runtime::{
    BatchingConfig, EmitOptions, Runtime, RuntimeConfig, TimeoutMiddleware, TracingMiddleware,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, EventPayload)]
#[event(priority = 0)]
enum OrderEvent {
    Placed { order_id: String, amount: i64 },
    #[event(event_type = "order.shipped", priority = 5)]
    Shipped { order_id: String },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pulse_runtime=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let runtime = Runtime::new(RuntimeConfig {
        enable_observability: true,
        enable_event_store: true,
        ack_timeout: Duration::from_secs(5),
        middleware: vec![
            Arc::new(TracingMiddleware),
            Arc::new(TimeoutMiddleware::new(Duration::from_secs(1))),
        ],
        batching: BatchingConfig {
            enabled: true,
            default_batch_size: 3,
            flush_on_event_types: vec!["order.shipped".into()],
            ..Default::default()
        },
        ..Default::default()
    });

    // 下单后自动发货
    let shipper = runtime.clone();
    runtime.on(
        "OrderEvent.Placed",
        handler_fn("shipper", move |event: Event| {
            let shipper = shipper.clone();
            async move {
                let order_id = event.payload()["Placed"]["order_id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                shipper.emit_payload(
                    &OrderEvent::Shipped { order_id },
                    EmitOptions::caused_by(&event),
                );
                Ok(())
            }
        }),
    );
    runtime.on(
        "order.shipped",
        handler_fn("notifier", |event: Event| async move {
            info!(depth = event.metadata().depth(), payload = %event.payload(), "customer notified");
            Ok(())
        }),
    );

    for n in 1..=3 {
        let placed = OrderEvent::Placed {
            order_id: format!("ord-{n}"),
            amount: n * 100,
        };
        let result = runtime.emit_payload(&placed, EmitOptions::default());
        println!("emitted: {} queued={}", result.event_id, result.queued);
    }
    runtime.flush_batch().await?;

    for round in 1..=3 {
        let stats = runtime.process().await?;
        println!("round {round}: {stats:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let acme = runtime.for_tenant("acme");
    acme.emit_async("tenant.hello", json!({ "from": "acme" }), EmitOptions::default())
        .await;

    let stats = runtime.get_stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!(
        "acme queue: {:?}",
        acme.get_queue_snapshot(10)
            .into_iter()
            .map(|item| item.event_type)
            .collect::<Vec<_>>()
    );

    acme.cleanup().await;
    runtime.cleanup().await;
    Ok(())
}
