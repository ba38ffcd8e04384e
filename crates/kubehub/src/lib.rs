//! factbridge kubehub: Kubernetes watchers feeding the transaction scheduler.
//!
//! Per watched kind: a reflector-backed cache, a [`WorkQueue`] of
//! `namespace/name` keys filled by the watch stream, and workers that turn
//! each key into an upsert or a delete against the kind's table.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{anyhow, Result};
use factbridge_core::{Command, TableId};
use factbridge_marshal::{self as marshal, ConvertError, Fact, Marshal};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::networking::v1 as netv1;
use kube::{
    api::Api,
    runtime::{
        reflector::{self, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource,
};
use rustc_hash::FxHashSet;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod cache;
pub mod queue;

pub use cache::{join_key, object_key, split_key, MapCache, ObjectCache};
pub use queue::WorkQueue;

/// A Kubernetes kind mirrored into an engine input table.
pub trait Watched: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static {
    type Model: Fact;

    /// Short name for logs and queue labels.
    const KIND: &'static str;

    fn to_model(&self) -> Result<Self::Model, ConvertError>;
}

impl Watched for corev1::Namespace {
    type Model = marshal::Namespace;
    const KIND: &'static str = "namespace";

    fn to_model(&self) -> Result<Self::Model, ConvertError> { Ok(marshal::Namespace::from(self)) }
}

impl Watched for corev1::Pod {
    type Model = marshal::Pod;
    const KIND: &'static str = "pod";

    fn to_model(&self) -> Result<Self::Model, ConvertError> { Ok(marshal::Pod::from(self)) }
}

impl Watched for netv1::NetworkPolicy {
    type Model = marshal::NetworkPolicy;
    const KIND: &'static str = "networkpolicy";

    fn to_model(&self) -> Result<Self::Model, ConvertError> { marshal::NetworkPolicy::try_from(self) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Upserted,
    Deleted,
    /// The object could not be converted; any row it had before was deleted.
    Retracted,
}

/// Turn one key into a command: the cached object if present, a delete by key otherwise.
pub async fn process_key<K, C>(key: &str, cache: &C, table: TableId, tx: &mpsc::Sender<Command>) -> Result<Processed>
where
    K: Watched,
    C: ObjectCache<K> + ?Sized,
{
    let (namespace, name) = split_key(key);
    let (cmd, outcome) = match cache.get(namespace, name) {
        Some(obj) => match obj.to_model() {
            Ok(model) => {
                let value = model.encode();
                debug!(kind = K::KIND, key, value = %value, "upsert");
                (Command::insert_or_update(table, value), Processed::Upserted)
            }
            Err(e) => {
                // the last good version must not outlive an update the engine cannot see
                warn!(kind = K::KIND, key, error = %e, "object cannot be converted; retracting its row");
                (Command::delete_key(table, K::Model::encode_key(namespace, name)), Processed::Retracted)
            }
        },
        None => {
            debug!(kind = K::KIND, key, "delete");
            (Command::delete_key(table, K::Model::encode_key(namespace, name)), Processed::Deleted)
        }
    };
    tx.send(cmd).await.map_err(|_| anyhow!("command channel closed while sending {} {}", K::KIND, key))?;
    Ok(outcome)
}

/// Drain `queue` until it shuts down or `shutdown` turns true.
pub async fn run_worker<K, C>(
    queue: WorkQueue,
    cache: C,
    table: TableId,
    tx: mpsc::Sender<Command>,
    mut shutdown: watch::Receiver<bool>,
) where
    K: Watched,
    C: ObjectCache<K>,
{
    loop {
        let key = tokio::select! {
            next = queue.next() => match next {
                Some(key) => key,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        match process_key::<K, C>(&key, &cache, table, &tx).await {
            Ok(_) => queue.forget(&key),
            Err(e) => {
                let delay = queue.add_rate_limited(&key);
                warn!(kind = K::KIND, key = %key, error = %e, retry_in_ms = delay.as_millis() as u64, "key processing failed");
            }
        }
        queue.done(&key);
    }
    debug!(kind = K::KIND, "worker stopped");
}

/// Start a reflector-backed watch of every `K` in the cluster.
///
/// Every event enqueues the affected key. After a relist, keys that were
/// known before but are absent from the new list are enqueued too, so their
/// deletion is observed even if the delete event itself was missed.
pub fn watch_kind<K: Watched>(
    client: Client,
    queue: WorkQueue,
    mut shutdown: watch::Receiver<bool>,
) -> (Store<K>, JoinHandle<Result<()>>) {
    let api: Api<K> = Api::all(client);
    let (reader, writer) = reflector::store::<K>();
    let task = tokio::spawn(async move {
        let stream = reflector::reflector(writer, watcher::watcher(api, watcher::Config::default()).default_backoff());
        futures::pin_mut!(stream);
        let mut known: FxHashSet<String> = FxHashSet::default();
        info!(kind = K::KIND, "watcher started");
        loop {
            let ev = tokio::select! {
                ev = stream.try_next() => ev,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            match ev {
                Ok(Some(Event::Applied(obj))) => {
                    let key = object_key(&obj);
                    known.insert(key.clone());
                    queue.add(key);
                }
                Ok(Some(Event::Deleted(obj))) => {
                    let key = object_key(&obj);
                    known.remove(&key);
                    queue.add(key);
                }
                Ok(Some(Event::Restarted(list))) => {
                    let fresh: FxHashSet<String> = list.iter().map(object_key).collect();
                    let vanished: Vec<String> = known.difference(&fresh).cloned().collect();
                    debug!(kind = K::KIND, count = fresh.len(), vanished = vanished.len(), "watch relisted");
                    for key in vanished.into_iter().chain(fresh.iter().cloned()) {
                        queue.add(key);
                    }
                    known = fresh;
                }
                Ok(None) => {
                    warn!(kind = K::KIND, "watch stream ended");
                    break;
                }
                Err(e) => warn!(kind = K::KIND, error = %e, "watch error; backing off"),
            }
        }
        queue.shut_down();
        info!(kind = K::KIND, "watcher stopped");
        Ok(())
    });
    (reader, task)
}

/// Tasks serving one watched kind.
pub struct KindTasks {
    pub queue: WorkQueue,
    pub watcher: JoinHandle<Result<()>>,
    pub workers: Vec<JoinHandle<()>>,
}

impl KindTasks {
    pub async fn join(self) {
        match self.watcher.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(queue = self.queue.name(), error = ?e, "watcher failed"),
            Err(e) => warn!(queue = self.queue.name(), error = %e, "watcher task panicked"),
        }
        for w in self.workers {
            let _ = w.await;
        }
    }
}

/// Watch `K` and run `workers` key workers sending into `tx`.
pub fn spawn_kind<K: Watched>(
    client: Client,
    table: TableId,
    tx: mpsc::Sender<Command>,
    shutdown: watch::Receiver<bool>,
    workers: usize,
) -> KindTasks {
    let queue = WorkQueue::new(K::KIND);
    let (store, watcher) = watch_kind::<K>(client, queue.clone(), shutdown.clone());
    let workers = (0..workers.max(1))
        .map(|_| {
            tokio::spawn(run_worker::<K, Store<K>>(queue.clone(), store.clone(), table, tx.clone(), shutdown.clone()))
        })
        .collect();
    info!(kind = K::KIND, table = <K::Model as Fact>::TABLE, "kind pipeline started");
    KindTasks { queue, watcher, workers }
}
