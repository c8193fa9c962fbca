//! Queue back-pressure and graceful stop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

use request_engine::config::schema::TransportKind;
use request_engine::connection::Connection;
use request_engine::{handler_ref, AccessFilterList, EngineState, HandlerResult};

mod common;

fn parked_handler(
    entered: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
) -> request_engine::HandlerRef {
    handler_ref(move |conn: &mut Connection| -> HandlerResult {
        entered.fetch_add(1, Ordering::SeqCst);
        for _ in 0..2000 {
            if released.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        conn.response_mut().set_body("done");
        Ok(())
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_queue_answers_503() {
    let entered = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicBool::new(false));
    let mut config = common::test_config(TransportKind::Http);
    config.workers.concurrency = 1;
    config.workers.queue_capacity = 1;
    let (engine, addr) = common::start_engine(
        parked_handler(Arc::clone(&entered), Arc::clone(&released)),
        AccessFilterList::default(),
        config,
    )
    .await;
    let client = reqwest::Client::new();

    let send = |path: &'static str| {
        let client = client.clone();
        tokio::spawn(async move { client.get(common::url(addr, path)).send().await.unwrap() })
    };

    let busy = send("/busy");
    assert!(common::wait_until(Duration::from_secs(5), || entered.load(Ordering::SeqCst) == 1).await);
    let queued = send("/queued");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let rejected = send("/overflow").await.unwrap();
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);

    released.store(true, Ordering::SeqCst);
    assert_eq!(busy.await.unwrap().status(), StatusCode::OK);
    assert_eq!(queued.await.unwrap().status(), StatusCode::OK);

    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_lets_running_handler_finish() {
    let entered = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicBool::new(false));
    let mut config = common::test_config(TransportKind::Http);
    config.workers.concurrency = 1;
    let (engine, addr) = common::start_engine(
        parked_handler(Arc::clone(&entered), Arc::clone(&released)),
        AccessFilterList::default(),
        config,
    )
    .await;

    let in_flight = tokio::spawn(async move {
        reqwest::Client::new()
            .get(common::url(addr, "/slow"))
            .send()
            .await
            .unwrap()
    });
    assert!(common::wait_until(Duration::from_secs(5), || entered.load(Ordering::SeqCst) == 1).await);

    let stopping = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.stop().await })
    };
    assert!(common::wait_until(Duration::from_secs(5), || engine.state() == EngineState::Stopping).await);

    released.store(true, Ordering::SeqCst);
    let res = in_flight.await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "done");

    stopping.await.unwrap().unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(reqwest::Client::new()
        .get(common::url(addr, "/after"))
        .send()
        .await
        .is_err());
}
