mod common;

use std::collections::HashSet;

use flixsrota::queue::{Job, JobStatus, JobStore};

use common::sqlite_store;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dequeue_hands_out_each_job_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;

    let mut ids = HashSet::new();
    for i in 0..40 {
        let id = store
            .enqueue(Job::new(format!("in{i}"), "out").with_priority(i % 4))
            .await
            .unwrap();
        ids.insert(id);
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(job) = store.dequeue().await.unwrap() {
                assert_eq!(job.status, JobStatus::Processing);
                got.push(job.id);
            }
            got
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "job dispatched twice");
        }
    }

    assert_eq!(seen, ids);
    assert_eq!(store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_jobs_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let store = sqlite_store(&dir).await;
        let id = store
            .enqueue(Job::new("in", "out").with_priority(2).with_metadata("owner", "alice"))
            .await
            .unwrap();
        store.close().await;
        id
    };

    let store = sqlite_store(&dir).await;
    assert_eq!(store.queue_depth().await.unwrap(), 1);
    let job = store.dequeue().await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.metadata.get("owner").map(String::as_str), Some("alice"));
}
