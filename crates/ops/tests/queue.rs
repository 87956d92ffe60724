#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use subsync_ops::{Executor, WorkQueue};
use tokio_util::sync::CancellationToken;

/// Records every id it sees. "boom" panics, "fail" errors, "again" asks for one retry.
#[derive(Default)]
struct Script {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Executor for Script {
    async fn execute(&self, id: &str) -> Result<Duration> {
        let runs = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(id.to_string());
            seen.iter().filter(|s| *s == id).count()
        };
        match id {
            "boom" => panic!("executor exploded"),
            "fail" => bail!("storage down"),
            "again" if runs == 1 => Ok(Duration::from_secs(10)),
            _ => Ok(Duration::ZERO),
        }
    }
}

async fn wait_for(script: &Script, n: usize) {
    for _ in 0..500 {
        if script.seen.lock().unwrap().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("executor saw {:?}", script.seen.lock().unwrap());
}

#[tokio::test]
async fn worker_survives_a_panicking_executor() {
    let script = Arc::new(Script::default());
    let q = Arc::new(WorkQueue::new("provisioning", script.clone(), Duration::from_secs(60), Duration::from_secs(60)));
    let cancel = CancellationToken::new();
    let handles = q.run(1, cancel.clone());

    q.add("boom");
    q.add("fail");
    q.add("ok");
    wait_for(&script, 3).await;
    assert_eq!(*script.seen.lock().unwrap(), vec!["boom", "fail", "ok"]);

    cancel.cancel();
    futures::future::join_all(handles).await;
}

#[tokio::test]
async fn backoff_requeues_the_item() {
    let script = Arc::new(Script::default());
    let q = Arc::new(
        WorkQueue::new("update", script.clone(), Duration::from_secs(60), Duration::from_secs(60)).speed_up(1000),
    );
    let cancel = CancellationToken::new();
    let handles = q.run(2, cancel.clone());

    q.add("again");
    wait_for(&script, 2).await;
    assert_eq!(*script.seen.lock().unwrap(), vec!["again", "again"]);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(script.seen.lock().unwrap().len(), 2);

    cancel.cancel();
    futures::future::join_all(handles).await;
}
