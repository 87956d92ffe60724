#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use subsync_apply::{Processed, Updater};
use subsync_core::{QueueElement, SubaccountId, BETA_ENABLED_LABEL, SUBACCOUNT_ID_LABEL};
use subsync_kubehub::{ResourceApi, ResourceObject};
use subsync_store::SubaccountPriorityQueue;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeApi {
    objects: Mutex<Vec<ResourceObject>>,
    fail_list: Mutex<bool>,
    fail_names: Mutex<Vec<String>>,
}

impl FakeApi {
    fn add(&self, name: &str, sa: &str, beta: &str) {
        let mut labels = BTreeMap::new();
        labels.insert(SUBACCOUNT_ID_LABEL.to_string(), sa.to_string());
        labels.insert(BETA_ENABLED_LABEL.to_string(), beta.to_string());
        self.objects.lock().unwrap().push(ResourceObject { name: name.into(), uid: name.into(), labels, ..Default::default() });
    }

    fn beta(&self, name: &str) -> String {
        let objs = self.objects.lock().unwrap();
        objs.iter().find(|o| o.name == name).map(|o| o.beta_enabled().to_string()).unwrap_or_default()
    }
}

#[async_trait]
impl ResourceApi for FakeApi {
    async fn list_by_subaccount(&self, id: &SubaccountId) -> Result<Vec<ResourceObject>> {
        if *self.fail_list.lock().unwrap() {
            return Err(anyhow!("apiserver unavailable"));
        }
        let objs = self.objects.lock().unwrap();
        Ok(objs.iter().filter(|o| o.subaccount_id().as_ref() == Some(id)).cloned().collect())
    }

    async fn set_label(&self, obj: &ResourceObject, key: &str, value: &str) -> Result<()> {
        if self.fail_names.lock().unwrap().contains(&obj.name) {
            return Err(anyhow!("conflict on {}", obj.name));
        }
        let mut objs = self.objects.lock().unwrap();
        let o = objs.iter_mut().find(|o| o.name == obj.name).ok_or_else(|| anyhow!("not found"))?;
        o.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

fn el(sa: &str, beta: &str, at: i64) -> QueueElement {
    QueueElement { subaccount_id: sa.into(), beta_enabled: beta.into(), modified_at: at }
}

fn setup() -> (Arc<FakeApi>, Arc<SubaccountPriorityQueue>, Updater) {
    let api = Arc::new(FakeApi::default());
    let queue = Arc::new(SubaccountPriorityQueue::new());
    let updater = Updater::new(api.clone(), queue.clone(), Duration::from_millis(5));
    (api, queue, updater)
}

#[tokio::test]
async fn labels_every_runtime_of_the_subaccount() {
    let (api, queue, updater) = setup();
    api.add("r1", "sa1", "");
    api.add("r2", "sa1", "true");
    api.add("r3", "sa2", "true");
    queue.insert(el("sa1", "false", 1));
    assert_eq!(updater.process_next().await, Processed::Updated { subaccount: "sa1".into(), resources: 2 });
    assert_eq!(api.beta("r1"), "false");
    assert_eq!(api.beta("r2"), "false");
    assert_eq!(api.beta("r3"), "true");
    assert_eq!(updater.process_next().await, Processed::Idle);
}

#[tokio::test]
async fn list_failure_requeues() {
    let (api, queue, updater) = setup();
    *api.fail_list.lock().unwrap() = true;
    queue.insert(el("sa1", "true", 3));
    assert_eq!(updater.process_next().await, Processed::Requeued { subaccount: "sa1".into() });
    assert_eq!(queue.extract(), Some(el("sa1", "true", 3)));
}

#[tokio::test]
async fn partial_update_failure_requeues_after_trying_all() {
    let (api, queue, updater) = setup();
    api.add("r1", "sa1", "false");
    api.add("r2", "sa1", "false");
    api.fail_names.lock().unwrap().push("r1".into());
    queue.insert(el("sa1", "true", 1));
    assert_eq!(updater.process_next().await, Processed::Requeued { subaccount: "sa1".into() });
    assert_eq!(api.beta("r2"), "true");
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn no_resources_drops_the_item() {
    let (_api, queue, updater) = setup();
    queue.insert(el("ghost", "true", 1));
    assert_eq!(updater.process_next().await, Processed::NoResources { subaccount: "ghost".into() });
    assert!(queue.is_empty());
}

#[tokio::test]
async fn run_drains_and_stops_on_cancel() {
    let (api, queue, updater) = setup();
    api.add("r1", "sa1", "");
    queue.insert(el("sa1", "true", 1));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(updater.run(cancel.clone()));
    for _ in 0..100 {
        if api.beta("r1") == "true" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(api.beta("r1"), "true");
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}
