//! Streams condition transitions of reconciled records as they happen.
//!
//! The tailer runs in its own task and only reads the watch stream, so a
//! slow sink never holds up a reconcile pass.

use std::collections::HashMap;

use carton_core::{ConditionStatus, ConditionType, APP_KIND, INSTALL_REQUEST_KIND};
use futures::{FutureExt, StreamExt};
use resource_store::{ObjectKey, ResourceStore, WatchEvent, WatchEventType};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::reconciler::record_status;

type Fact = (ConditionType, ConditionStatus, String, String);

#[derive(Default)]
struct Seen {
    facts: Vec<Fact>,
    paused: bool,
    deleting: bool,
}

#[derive(Default)]
struct Tail {
    seen: HashMap<ObjectKey, Seen>,
    lines: Vec<String>,
}

impl Tail {
    fn observe(&mut self, event: &WatchEvent, sink: &(dyn Fn(&str) + Send + Sync)) {
        if event.event_type == WatchEventType::Lagged {
            return;
        }
        let object = &event.object;
        let key = object.key();
        let label = format!("{}/{}", object.kind, object.metadata.name);

        if event.event_type == WatchEventType::Deleted {
            self.seen.remove(&key);
            self.emit(sink, format!("{label}: deleted"));
            return;
        }

        let status = record_status(object);
        let previous = self.seen.remove(&key).unwrap_or_default();
        let mut lines = Vec::new();
        let facts: Vec<Fact> = status
            .conditions
            .iter()
            .map(|c| (c.condition_type, c.status, c.reason.clone(), c.message.clone()))
            .collect();
        for (condition, fact) in status.conditions.iter().zip(&facts) {
            if previous.facts.contains(fact) {
                continue;
            }
            let mut line = format!(
                "{} {label}: {}={}",
                condition.last_transition_time.format("%H:%M:%S"),
                condition.condition_type,
                condition.status
            );
            if !condition.reason.is_empty() {
                line.push_str(&format!(" ({})", condition.reason));
            }
            if !condition.message.is_empty() {
                line.push_str(&format!(": {}", condition.message));
            }
            lines.push(line);
        }
        let paused = status.friendly_description == "Paused";
        if paused && !previous.paused {
            lines.push(format!("{label}: paused"));
        }
        let deleting = object.is_deleting();
        if deleting && !previous.deleting {
            lines.push(format!("{label}: deleting"));
        }

        self.seen.insert(
            key,
            Seen {
                facts,
                paused,
                deleting,
            },
        );
        for line in lines {
            self.emit(sink, line);
        }
    }

    fn emit(&mut self, sink: &(dyn Fn(&str) + Send + Sync), line: String) {
        sink(&line);
        self.lines.push(line);
    }
}

pub struct TailerHandle {
    stop: oneshot::Sender<()>,
    join: JoinHandle<Vec<String>>,
}

impl TailerHandle {
    /// Stop tailing after draining events already delivered, and return
    /// every line emitted.
    pub async fn stop(self) -> Vec<String> {
        let _ = self.stop.send(());
        self.join.await.unwrap_or_default()
    }
}

/// Start tailing InstallRequests and Apps in `namespace` (all namespaces
/// when `None`). Every transition is passed to `sink` as one line.
pub fn spawn_tailer(
    store: &dyn ResourceStore,
    namespace: Option<&str>,
    sink: impl Fn(&str) + Send + Sync + 'static,
) -> TailerHandle {
    let mut events = futures::stream::select_all([
        store.watch(INSTALL_REQUEST_KIND, namespace),
        store.watch(APP_KIND, namespace),
    ]);
    let (stop, mut stopped) = oneshot::channel::<()>();

    let join = tokio::spawn(async move {
        let mut tail = Tail::default();
        loop {
            tokio::select! {
                _ = &mut stopped => break,
                event = events.next() => match event {
                    Some(event) => tail.observe(&event, &sink),
                    None => return tail.lines,
                },
            }
        }
        while let Some(Some(event)) = events.next().now_or_never() {
            tail.observe(&event, &sink);
        }
        tail.lines
    });

    TailerHandle { stop, join }
}
