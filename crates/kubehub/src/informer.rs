use anyhow::Result;
use futures::StreamExt;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ResourceObject;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    Added(ResourceObject),
    Updated { old: ResourceObject, new: ResourceObject },
    Deleted(ResourceObject),
}

/// Last seen version of every watched object; turns watcher events into
/// add/update/delete notifications.
#[derive(Debug, Default)]
pub struct InformerCache {
    objects: FxHashMap<String, ResourceObject>,
}

impl InformerCache {
    pub fn len(&self) -> usize { self.objects.len() }
    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    pub fn applied(&mut self, obj: ResourceObject) -> ResourceEvent {
        match self.objects.insert(obj.key(), obj.clone()) {
            Some(old) => ResourceEvent::Updated { old, new: obj },
            None => ResourceEvent::Added(obj),
        }
    }

    pub fn deleted(&mut self, obj: ResourceObject) -> ResourceEvent {
        self.objects.remove(&obj.key());
        ResourceEvent::Deleted(obj)
    }

    /// Relist after a watch restart. Objects missing from `list` were deleted
    /// while the watch was down.
    pub fn restarted(&mut self, list: Vec<ResourceObject>) -> Vec<ResourceEvent> {
        let fresh: FxHashSet<String> = list.iter().map(ResourceObject::key).collect();
        let gone: Vec<String> = self.objects.keys().filter(|k| !fresh.contains(*k)).cloned().collect();
        let mut out: Vec<ResourceEvent> = gone
            .into_iter()
            .filter_map(|k| self.objects.remove(&k))
            .map(ResourceEvent::Deleted)
            .collect();
        out.extend(list.into_iter().map(|o| self.applied(o)));
        out
    }
}

/// Watch `api` and forward resource events until `cancel` fires or the receiver is dropped.
pub async fn start_informer(
    api: Api<DynamicObject>,
    tx: mpsc::Sender<ResourceEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    let mut cache = InformerCache::default();
    info!("informer started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = stream.next() => ev,
        };
        let Some(ev) = next else {
            warn!("watcher stream ended");
            break;
        };
        let events = match ev {
            Ok(Event::Applied(o)) => vec![cache.applied(ResourceObject::from_dynamic(&o))],
            Ok(Event::Deleted(o)) => vec![cache.deleted(ResourceObject::from_dynamic(&o))],
            Ok(Event::Restarted(list)) => {
                debug!(count = list.len(), "watch restart");
                cache.restarted(list.iter().map(ResourceObject::from_dynamic).collect())
            }
            Err(e) => {
                warn!(error = %e, "watch error");
                continue;
            }
        };
        for e in events {
            if tx.send(e).await.is_err() {
                debug!("informer receiver dropped");
                return Ok(());
            }
        }
    }
    info!(cached = cache.len(), "informer stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(uid: &str, beta: &str) -> ResourceObject {
        let mut o = ResourceObject { name: format!("rt-{uid}"), uid: uid.into(), ..Default::default() };
        o.labels.insert(subsync_core::BETA_ENABLED_LABEL.into(), beta.into());
        o
    }

    #[test]
    fn second_apply_is_an_update_with_old_state() {
        let mut c = InformerCache::default();
        assert!(matches!(c.applied(obj("a", "")), ResourceEvent::Added(_)));
        match c.applied(obj("a", "true")) {
            ResourceEvent::Updated { old, new } => {
                assert_eq!(old.beta_enabled(), "");
                assert_eq!(new.beta_enabled(), "true");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn restart_reports_vanished_objects() {
        let mut c = InformerCache::default();
        c.applied(obj("a", "true"));
        c.applied(obj("b", "true"));
        let events = c.restarted(vec![obj("b", "false"), obj("c", "")]);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ResourceEvent::Deleted(o) if o.uid == "a"));
        assert!(matches!(&events[1], ResourceEvent::Updated { new, .. } if new.uid == "b"));
        assert!(matches!(&events[2], ResourceEvent::Added(o) if o.uid == "c"));
        assert_eq!(c.len(), 2);
    }
}
