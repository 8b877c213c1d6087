//! Correlation tables on real tokio timers.
//!
//! Uses a paused runtime so sleeps advance virtual time instantly.

use std::sync::Arc;
use std::time::Duration;

use correlate_core::{
    CorrelationTable, Delay, MessageOptions, MessageTable, RegisterOptions, TimedOut, TokioTimer,
};
use serde_json::{Value, json};

fn tokio_table<T: Send + 'static>() -> (Arc<TokioTimer>, CorrelationTable<String, T>) {
    let timer = Arc::new(TokioTimer::current().unwrap());
    let table = CorrelationTable::new(timer.clone());
    (timer, table)
}

#[tokio::test(start_paused = true)]
async fn promise_resolves_before_timeout() {
    let (timer, table) = tokio_table::<u32>();
    let future = table
        .register_promise(
            "req-1".to_string(),
            RegisterOptions::new().delay(Delay::from_millis(500)),
        )
        .unwrap();

    let responder = table.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        responder.resolve("req-1", 99);
    });

    assert_eq!(future.await.unwrap(), 99);
    assert_eq!(timer.scheduled(), 0);
    assert!(table.is_empty());
}

#[tokio::test(start_paused = true)]
async fn promise_rejects_after_timeout() {
    let (_timer, table) = tokio_table::<u32>();
    let future = table
        .register_promise(
            "req-1".to_string(),
            RegisterOptions::new()
                .delay(Duration::from_millis(250))
                .failure_message("backend unavailable"),
        )
        .unwrap();

    let err = future.await.unwrap_err();
    let failure = err.downcast_ref::<TimedOut>().unwrap();
    assert_eq!(failure.message, "backend unavailable");
    assert!(!table.resolve("req-1", 1));
    assert_eq!(table.stats().timed_out, 1);
}

#[tokio::test(start_paused = true)]
async fn close_breaks_outstanding_promises() {
    let (timer, table) = tokio_table::<u32>();
    let future = table
        .register_promise(
            "req-1".to_string(),
            RegisterOptions::new().delay(Delay::from_secs(30)),
        )
        .unwrap();

    assert_eq!(table.close(), 1);
    assert_eq!(timer.scheduled(), 0);
    let err = future.await.unwrap_err();
    assert!(err.downcast_ref::<promise::BrokenPromise>().is_some());
}

#[tokio::test(start_paused = true)]
async fn message_table_round_trip() {
    let timer = Arc::new(TokioTimer::current().unwrap());
    let table: MessageTable<Value> = MessageTable::new(timer);

    let request = json!({"request_id": "abc", "method": "status"});
    let future = table
        .register_promise(&request, MessageOptions::new().delay(Delay::from_secs(1)))
        .unwrap()
        .unwrap();

    let transport = table.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.resolve(json!({"request_id": "abc", "status": "ok"}));
    });

    let response = future.await.unwrap();
    assert_eq!(response["status"], "ok");
}

#[tokio::test(start_paused = true)]
async fn dropping_table_aborts_timers() {
    let (timer, table) = tokio_table::<u32>();
    table
        .register(
            "req-1".to_string(),
            |_| panic!("must not resolve"),
            |_| panic!("must not time out"),
            RegisterOptions::new().delay(Delay::from_millis(10)),
        )
        .unwrap();
    drop(table);
    assert_eq!(timer.scheduled(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
}
