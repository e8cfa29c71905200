//! Feeds observed creates and deletes back into the expectation tracker
//!
//! Pods, Jobs and PVCs carrying the cluster label are watched independently
//! of the controller. The first sighting of an object UID counts as an
//! observed creation; a delete event, or a UID missing from a relist, counts
//! as an observed deletion.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::watcher::Event;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{info, trace, warn};

use crate::controller::expectations::{ExpectationTracker, OwnerKey};
use crate::controller::managed_resources::OwnedResource;
use crate::resources::common::CLUSTER_LABEL;

/// Objects of one kind seen so far, by UID
///
/// The owner key is kept so deletions missed while the watch was down can
/// still be attributed when the relist completes.
pub struct SeenObjects<K> {
    seen: HashMap<String, Option<OwnerKey>>,
    relist: Option<HashMap<String, Option<OwnerKey>>>,
    _kind: std::marker::PhantomData<K>,
}

impl<K> Default for SeenObjects<K> {
    fn default() -> Self {
        Self {
            seen: HashMap::new(),
            relist: None,
            _kind: std::marker::PhantomData,
        }
    }
}

impl<K: OwnedResource> SeenObjects<K> {
    /// Apply one watch event to the tracker
    pub fn handle(&mut self, expectations: &ExpectationTracker, event: Event<K>) {
        match event {
            Event::Apply(obj) => self.saw(expectations, &obj),
            Event::Delete(obj) => {
                let uid = obj.uid().unwrap_or_default();
                self.seen.remove(&uid);
                if let Some(key) = obj.owner_key() {
                    trace!(kind = %K::RESOURCE_KIND, name = %obj.name_any(), "Observed deletion");
                    expectations.observe_deletion(&key, K::RESOURCE_KIND);
                }
            }
            Event::Init => self.relist = Some(HashMap::new()),
            Event::InitApply(obj) => {
                if let (Some(relist), Some(uid)) = (self.relist.as_mut(), obj.uid()) {
                    relist.insert(uid, obj.owner_key());
                }
                self.saw(expectations, &obj);
            }
            Event::InitDone => {
                let Some(relist) = self.relist.take() else {
                    return;
                };
                for (uid, key) in &self.seen {
                    if relist.contains_key(uid) {
                        continue;
                    }
                    if let Some(key) = key {
                        expectations.observe_deletion(key, K::RESOURCE_KIND);
                    }
                }
                self.seen = relist;
            }
        }
    }

    fn saw(&mut self, expectations: &ExpectationTracker, obj: &K) {
        let Some(uid) = obj.uid() else {
            return;
        };
        if self.seen.contains_key(&uid) {
            return;
        }
        let key = obj.owner_key();
        if let Some(key) = &key {
            trace!(kind = %K::RESOURCE_KIND, name = %obj.name_any(), "Observed creation");
            expectations.observe_creation(key, K::RESOURCE_KIND);
        }
        self.seen.insert(uid, key);
    }

    /// Number of objects currently known
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Watch Pods, Jobs and PVCs until the streams end
pub async fn run_expectation_observer(
    client: Client,
    namespace: Option<&str>,
    expectations: Arc<ExpectationTracker>,
) {
    info!("Starting expectation observer");

    let pods: Api<Pod> = crate::scoped_api(client.clone(), namespace);
    let jobs: Api<Job> = crate::scoped_api(client.clone(), namespace);
    let pvcs: Api<PersistentVolumeClaim> = crate::scoped_api(client, namespace);

    tokio::join!(
        observe(pods, expectations.clone()),
        observe(jobs, expectations.clone()),
        observe(pvcs, expectations),
    );

    warn!("Expectation observer streams ended unexpectedly");
}

async fn observe<K>(api: Api<K>, expectations: Arc<ExpectationTracker>)
where
    K: OwnedResource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let config = watcher::Config::default().labels(CLUSTER_LABEL);
    let mut seen = SeenObjects::<K>::default();
    let mut stream = watcher(api, config).default_backoff().boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => seen.handle(&expectations, event),
            Err(e) => warn!(kind = %K::RESOURCE_KIND, "Watch error: {}", e),
        }
    }
}
