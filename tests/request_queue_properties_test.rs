//! Queue partition invariants under longer operation sequences

use std::collections::HashSet;
use std::sync::Arc;

use crawlkit::{Request, RequestProvider, RequestQueue};

#[tokio::test]
async fn partitions_always_cover_every_added_key() {
    let queue = RequestQueue::default();
    let mut expected_keys = HashSet::new();

    // Interleave adds, fetches, reclaims and handled marks.
    for i in 0..50 {
        let request = Request::new(format!("http://h/{i}"));
        expected_keys.insert(request.unique_key.clone());
        queue
            .add_request(request, i % 7 == 0)
            .await
            .expect("add succeeds");

        if i % 2 == 0 {
            if let Some(fetched) = queue.fetch_next_request().await.expect("fetch succeeds") {
                if i % 4 == 0 {
                    queue
                        .mark_request_as_handled(fetched)
                        .await
                        .expect("mark succeeds");
                } else {
                    queue
                        .reclaim_request(fetched, i % 8 == 2)
                        .await
                        .expect("reclaim succeeds");
                }
            }
        }
    }

    let metadata = queue.metadata();
    assert_eq!(metadata.total_request_count, expected_keys.len());
    assert_eq!(
        metadata.pending_request_count + metadata.handled_request_count
            + queue.in_progress_count(),
        expected_keys.len(),
        "handled, pending and in-progress must partition the added keys"
    );

    // Drain the rest; every key must surface exactly once overall.
    let mut seen = HashSet::new();
    while let Some(request) = queue.fetch_next_request().await.expect("fetch succeeds") {
        assert!(seen.insert(request.unique_key.clone()), "no key twice");
        queue
            .mark_request_as_handled(request)
            .await
            .expect("mark succeeds");
    }
    assert_eq!(queue.handled_count().await, expected_keys.len());
}

#[tokio::test]
async fn concurrent_fetchers_never_share_a_lease() {
    let queue = Arc::new(RequestQueue::default());
    for i in 0..100 {
        queue
            .add_request(Request::new(format!("http://h/{i}")), false)
            .await
            .expect("add succeeds");
    }

    let mut workers = Vec::new();
    for _ in 0..8 {
        let queue = Arc::clone(&queue);
        workers.push(tokio::spawn(async move {
            let mut fetched = Vec::new();
            while let Some(request) = queue.fetch_next_request().await.expect("fetch succeeds") {
                fetched.push(request.unique_key.clone());
                queue
                    .mark_request_as_handled(request)
                    .await
                    .expect("mark succeeds");
            }
            fetched
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.expect("worker finishes"));
    }

    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 100, "every request processed");
    assert_eq!(unique.len(), 100, "no request processed twice");
    assert!(queue.is_finished().await);
}
