//! Event bridge and work queue integration tests
//!
//! Run with: `cargo test -p common --test bridge_tests`

use common::{ThreadWorkQueue, WorkQueue, create_event_bridge};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[test]
fn test_many_producers_one_consumer() {
    let (tx, rx) = create_event_bridge::<(usize, usize)>(4);

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    tx.send_blocking((p, i)).unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    let mut last = [None::<usize>; 4];
    let mut total = 0;
    while let Ok((p, i)) = rx.recv_blocking() {
        // per-producer order is preserved
        if let Some(prev) = last[p] {
            assert!(i > prev);
        }
        last[p] = Some(i);
        total += 1;
    }

    for p in producers {
        p.join().unwrap();
    }
    assert_eq!(total, 200);
}

#[tokio::test]
async fn test_async_sender_blocking_receiver() {
    let (tx, rx) = create_event_bridge::<String>(2);

    let consumer = thread::spawn(move || rx.recv_blocking().unwrap());
    tx.send("AT\r".to_string()).await.unwrap();

    assert_eq!(consumer.join().unwrap(), "AT\r");
}

#[test]
fn test_work_queue_job_may_schedule_more_work() {
    let queue = Arc::new(ThreadWorkQueue::new("nested", 1, 8).unwrap());
    let done = Arc::new(AtomicUsize::new(0));

    let inner_queue = queue.clone();
    let inner_done = done.clone();
    queue
        .schedule(Box::new(move || {
            let done = inner_done.clone();
            inner_queue
                .schedule(Box::new(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
            inner_done.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    for _ in 0..100 {
        if done.load(Ordering::SeqCst) == 2 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(done.load(Ordering::SeqCst), 2);
}
