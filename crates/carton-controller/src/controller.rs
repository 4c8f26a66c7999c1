//! Watch-driven controller.
//!
//! Keeps one worker per InstallRequest and App, forwards spec changes and
//! deletions to it, and retriggers installs when versions of their package
//! are published or withdrawn.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use carton_core::{
    InstallRequestSpec, Object, PackageVersionSpec, Result, APP_KIND, INSTALL_REQUEST_KIND,
    PACKAGE_VERSION_KIND,
};
use futures::StreamExt;
use resource_store::{
    retry_transient, ObjectKey, Selector, StoredObject, WatchEvent, WatchEventType,
};
use tracing::{debug, info, warn};

use crate::reconciler::{Reconciler, Trigger};
use crate::worker::{spawn_worker, WorkerHandle};

struct Tracked {
    worker: WorkerHandle,
    /// Last generation forwarded to the worker.
    generation: u64,
    /// Package an InstallRequest refers to.
    package: Option<String>,
}

pub struct Controller {
    reconciler: Arc<Reconciler>,
    namespace: Option<String>,
    workers: HashMap<ObjectKey, Tracked>,
}

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            namespace: None,
            workers: HashMap::new(),
        }
    }

    /// Only reconcile records in `namespace`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Reconcile until `shutdown` resolves, then stop every worker after its
    /// current pass.
    pub async fn run<S>(mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let store = self.reconciler.store().clone();
        let namespace = self.namespace.clone();
        let ns = namespace.as_deref();

        // Subscribe before listing so nothing between the two is missed.
        let mut events = futures::stream::select_all([
            store.watch(INSTALL_REQUEST_KIND, ns),
            store.watch(APP_KIND, ns),
            store.watch(PACKAGE_VERSION_KIND, ns),
        ]);

        let retry = self.reconciler.config().store_retry.clone();
        let everything = Selector::everything();
        for kind in [INSTALL_REQUEST_KIND, APP_KIND] {
            let existing =
                retry_transient(&retry, "list-records", || store.list(kind, ns, &everything))
                    .await?;
            for object in existing {
                self.track(&object);
            }
        }
        info!(records = self.workers.len(), "controller started");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.next() => match event {
                    Some(event) if event.event_type == WatchEventType::Lagged => {
                        let kind = event.object.kind;
                        if let Err(err) = self.relist(&kind).await {
                            warn!(kind = %kind, error = %err, "re-list after lagged watch failed");
                        }
                    }
                    Some(event) => self.handle(event),
                    None => {
                        warn!("watch streams closed");
                        break;
                    }
                },
            }
        }

        for (_, tracked) in self.workers.drain() {
            tracked.worker.shutdown().await;
        }
        info!("controller stopped");
        Ok(())
    }

    fn handle(&mut self, event: WatchEvent) {
        let object = event.object;
        if object.kind == PACKAGE_VERSION_KIND {
            self.package_changed(&object);
            return;
        }

        self.workers.retain(|_, tracked| !tracked.worker.is_finished());
        let key = object.key();
        let deleted = event.event_type == WatchEventType::Deleted;
        let Some(tracked) = self.workers.get_mut(&key) else {
            if !deleted {
                self.track(&object);
            }
            return;
        };

        if deleted || object.is_deleting() {
            debug!(key = %key, "deletion requested");
            tracked.worker.abort_runs();
            tracked.worker.trigger(Trigger::Watch);
        } else if object.metadata.generation != tracked.generation {
            // status and metadata writes leave the generation alone
            tracked.generation = object.metadata.generation;
            tracked.package = package_of(&object);
            tracked.worker.trigger(Trigger::Watch);
        }
    }

    /// Catch up on `kind` after its watch dropped events.
    async fn relist(&mut self, kind: &str) -> Result<()> {
        let store = self.reconciler.store().clone();
        let retry = self.reconciler.config().store_retry.clone();
        let everything = Selector::everything();
        let ns = self.namespace.clone();
        let current = retry_transient(&retry, "relist-records", || {
            store.list(kind, ns.as_deref(), &everything)
        })
        .await?;
        info!(kind, records = current.len(), "re-listed after lagged watch");

        if kind == PACKAGE_VERSION_KIND {
            // any package may have changed
            for (key, tracked) in &self.workers {
                if let Some(package) = &tracked.package {
                    self.reconciler.resolver().invalidate(&key.namespace, package);
                    tracked.worker.trigger(Trigger::Watch);
                }
            }
            return Ok(());
        }

        let present: HashSet<ObjectKey> = current.iter().map(StoredObject::key).collect();
        for object in current {
            self.handle(WatchEvent {
                event_type: WatchEventType::Modified,
                object,
            });
        }
        // records removed while the watch lagged
        for (key, tracked) in &self.workers {
            if key.kind == kind && !present.contains(key) {
                tracked.worker.abort_runs();
                tracked.worker.trigger(Trigger::Watch);
            }
        }
        Ok(())
    }

    fn track(&mut self, object: &StoredObject) {
        let key = object.key();
        let worker = spawn_worker(self.reconciler.clone(), key.clone(), Trigger::Explicit);
        self.workers.insert(
            key,
            Tracked {
                worker,
                generation: object.metadata.generation,
                package: package_of(object),
            },
        );
    }

    fn package_changed(&mut self, object: &StoredObject) {
        let version = match Object::<PackageVersionSpec>::from_stored(object.clone()) {
            Ok(version) => version,
            Err(err) => {
                warn!(key = %object.key(), error = %err, "ignoring unreadable package version");
                return;
            }
        };
        let package = version.spec.ref_name.as_str();
        self.reconciler.resolver().invalidate(version.namespace(), package);
        for (key, tracked) in &self.workers {
            if key.namespace == version.namespace() && tracked.package.as_deref() == Some(package) {
                debug!(key = %key, package, version = %version.spec.version, "package versions changed");
                tracked.worker.trigger(Trigger::Watch);
            }
        }
    }
}

fn package_of(object: &StoredObject) -> Option<String> {
    if object.kind != INSTALL_REQUEST_KIND {
        return None;
    }
    Object::<InstallRequestSpec>::from_stored(object.clone())
        .ok()
        .map(|install| install.spec.package_ref.ref_name)
}
