// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Change observation for AccessFS Core
//!
//! Mutation producers hand raw signals to `publish`, which stamps a
//! sequence number and enqueues on an unbounded channel; producers never
//! wait for delivery. A dedicated worker drains the channel, coalesces
//! bursts inside the configured window, matches signals against subtree
//! subscriptions, and delivers batched records per sink.
//!
//! Delivery is best-effort: races between a fast-path mutation signal and
//! a concurrent unobserve may resolve either way.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::config::NotifyPolicy;
use crate::error::{CoreError, CoreResult};
use crate::registry::EntryRegistry;
use crate::types::{ChangeRecord, ChangeSink, ChangeType, ContextId, EntryId};

/// A raw mutation signal as emitted by storage/primitive collaborators.
/// Paths are absolute component sequences captured at emission time.
#[derive(Clone, Debug)]
pub struct RawMutation {
    pub entry: EntryId,
    pub change: ChangeType,
    pub path: Vec<String>,
    pub moved_from: Option<Vec<String>>,
}

struct Subscription {
    recursive: bool,
    sink: Arc<dyn ChangeSink>,
    /// Sequence fence: signals published before `observe()` are invisible.
    since: u64,
    errored: bool,
}

type SubMap = HashMap<(ContextId, EntryId), Subscription>;

enum WorkerMsg {
    Mutation(u64, RawMutation),
    Flush(mpsc::Sender<()>),
    Shutdown,
}

pub(crate) struct ChangeObservationHub {
    registry: Arc<EntryRegistry>,
    subs: Arc<Mutex<SubMap>>,
    tx: Mutex<mpsc::Sender<WorkerMsg>>,
    seq: AtomicU64,
    max_subscriptions: usize,
    worker: Option<JoinHandle<()>>,
}

impl ChangeObservationHub {
    pub fn new(
        registry: Arc<EntryRegistry>,
        policy: NotifyPolicy,
        max_subscriptions: usize,
    ) -> Self {
        let subs: Arc<Mutex<SubMap>> = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::channel();

        let worker_registry = registry.clone();
        let worker_subs = subs.clone();
        let worker = std::thread::Builder::new()
            .name("accessfs-notify".to_string())
            .spawn(move || {
                delivery_loop(rx, worker_registry, worker_subs, policy);
            })
            .expect("failed to spawn notify worker");

        Self {
            registry,
            subs,
            tx: Mutex::new(tx),
            seq: AtomicU64::new(0),
            max_subscriptions,
            worker: Some(worker),
        }
    }

    /// Register interest in a subtree. Re-observing the same (observer,
    /// root) pair replaces the prior subscription; exactly one delivery
    /// stream results.
    pub fn observe(
        &self,
        observer: ContextId,
        root: EntryId,
        recursive: bool,
        sink: Arc<dyn ChangeSink>,
    ) -> CoreResult<()> {
        self.registry.kind_of(root)?;
        let since = self.seq.load(Ordering::SeqCst);
        let mut subs = self.subs.lock().unwrap();
        if !subs.contains_key(&(observer, root)) && subs.len() >= self.max_subscriptions {
            return Err(CoreError::TooManySubscriptions);
        }
        subs.insert(
            (observer, root),
            Subscription {
                recursive,
                sink,
                since,
                errored: false,
            },
        );
        Ok(())
    }

    pub fn unobserve(&self, observer: ContextId, root: EntryId) {
        self.subs.lock().unwrap().remove(&(observer, root));
    }

    pub fn disconnect_all(&self, observer: ContextId) {
        self.subs.lock().unwrap().retain(|(o, _), _| *o != observer);
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    /// Producer fast path: stamp and enqueue, never wait for delivery
    pub fn publish(&self, mutation: RawMutation) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        // Send only fails when the worker is gone, i.e. during shutdown.
        let _ = self.tx.lock().unwrap().send(WorkerMsg::Mutation(seq, mutation));
    }

    /// Inject a watch failure for an entry. Matching subscriptions get one
    /// terminal `Errored` record and stop delivering until re-observed.
    pub fn post_error(&self, entry: EntryId) {
        let path = self.registry.path_of(entry).unwrap_or_default();
        self.publish(RawMutation {
            entry,
            change: ChangeType::Errored,
            path,
            moved_from: None,
        });
    }

    /// Block until everything published so far has been delivered
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.lock().unwrap().send(WorkerMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for ChangeObservationHub {
    fn drop(&mut self) {
        let _ = self.tx.lock().unwrap().send(WorkerMsg::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn delivery_loop(
    rx: mpsc::Receiver<WorkerMsg>,
    registry: Arc<EntryRegistry>,
    subs: Arc<Mutex<SubMap>>,
    policy: NotifyPolicy,
) {
    loop {
        let msg = match rx.recv() {
            Ok(msg) => msg,
            Err(_) => return,
        };
        let mut flush_acks = Vec::new();
        let mut batch = Vec::new();
        let mut shutdown = false;

        match msg {
            WorkerMsg::Shutdown => return,
            WorkerMsg::Flush(ack) => flush_acks.push(ack),
            WorkerMsg::Mutation(seq, m) => {
                batch.push((seq, m));
                collect_batch(
                    &rx,
                    &policy,
                    &mut batch,
                    &mut flush_acks,
                    &mut shutdown,
                );
            }
        }

        coalesce(&mut batch);
        deliver(&registry, &subs, &batch);

        for ack in flush_acks {
            let _ = ack.send(());
        }
        if shutdown {
            return;
        }
    }
}

/// Keep draining until the coalescing window closes, the batch fills, or a
/// control message arrives.
fn collect_batch(
    rx: &mpsc::Receiver<WorkerMsg>,
    policy: &NotifyPolicy,
    batch: &mut Vec<(u64, RawMutation)>,
    flush_acks: &mut Vec<mpsc::Sender<()>>,
    shutdown: &mut bool,
) {
    let deadline = Instant::now() + Duration::from_millis(policy.coalesce_window_ms);
    while batch.len() < policy.max_batch {
        let msg = if policy.coalesce_window_ms == 0 {
            match rx.try_recv() {
                Ok(msg) => msg,
                Err(_) => return,
            }
        } else {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match rx.recv_timeout(remaining) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    *shutdown = true;
                    return;
                }
            }
        };
        match msg {
            WorkerMsg::Mutation(seq, m) => batch.push((seq, m)),
            WorkerMsg::Flush(ack) => {
                // Deliver what we have before acking.
                flush_acks.push(ack);
                return;
            }
            WorkerMsg::Shutdown => {
                *shutdown = true;
                return;
            }
        }
    }
}

/// Fold runs of modify signals for the same entry into one, keeping the
/// latest signal of each run so sequence fences judge the fold by its
/// newest member.
fn coalesce(batch: &mut Vec<(u64, RawMutation)>) {
    let before = batch.len();
    batch.dedup_by(|next, prev| {
        let fold = next.1.change == ChangeType::Modified
            && prev.1.change == ChangeType::Modified
            && next.1.entry == prev.1.entry;
        if fold {
            prev.0 = next.0;
            std::mem::swap(&mut prev.1, &mut next.1);
        }
        fold
    });
    if batch.len() != before {
        trace!(folded = before - batch.len(), "coalesced modify burst");
    }
}

fn deliver(
    registry: &EntryRegistry,
    subs: &Mutex<SubMap>,
    batch: &[(u64, RawMutation)],
) {
    if batch.is_empty() {
        return;
    }

    // Build per-subscription record lists under the map lock, but call the
    // sinks after dropping it: a sink may unobserve from its callback.
    let mut outgoing: Vec<(Arc<dyn ChangeSink>, Vec<ChangeRecord>)> = Vec::new();
    {
        let mut subs = subs.lock().unwrap();
        for ((_observer, root), sub) in subs.iter_mut() {
            if sub.errored {
                continue;
            }
            let root_path = match registry.path_of(*root) {
                Ok(path) => path,
                Err(_) => {
                    // The watched root is gone; terminal error record.
                    warn!(root = %root, "subscription root vanished");
                    sub.errored = true;
                    outgoing.push((
                        sub.sink.clone(),
                        vec![ChangeRecord {
                            root: *root,
                            changed_entry: *root,
                            path_from_root: Vec::new(),
                            change_type: ChangeType::Errored,
                            moved_from_path: None,
                        }],
                    ));
                    continue;
                }
            };

            let mut records = Vec::new();
            for (seq, mutation) in batch {
                if *seq <= sub.since {
                    continue;
                }
                if let Some(record) =
                    record_for(*root, &root_path, sub.recursive, mutation)
                {
                    let terminal = record.change_type == ChangeType::Errored;
                    records.push(record);
                    if terminal {
                        sub.errored = true;
                        break;
                    }
                }
            }
            if !records.is_empty() {
                trace!(root = %root, count = records.len(), "delivering change records");
                outgoing.push((sub.sink.clone(), records));
            }
        }
    }

    for (sink, records) in outgoing {
        sink.on_change_records(&records);
    }
}

/// Relativize a mutation against one subscription; None when out of scope
fn record_for(
    root: EntryId,
    root_path: &[String],
    recursive: bool,
    mutation: &RawMutation,
) -> Option<ChangeRecord> {
    let new_rel = relative_path(root_path, &mutation.path, recursive);

    if mutation.change == ChangeType::Moved {
        let old_rel = mutation
            .moved_from
            .as_deref()
            .and_then(|from| relative_path(root_path, from, recursive));
        return match (new_rel, old_rel) {
            (Some(path_from_root), old_rel) => Some(ChangeRecord {
                root,
                changed_entry: mutation.entry,
                path_from_root,
                change_type: ChangeType::Moved,
                moved_from_path: old_rel,
            }),
            // Moved out of scope: report a disappearance at the old
            // location, never the new one.
            (None, Some(old_rel)) => Some(ChangeRecord {
                root,
                changed_entry: mutation.entry,
                path_from_root: old_rel,
                change_type: ChangeType::Deleted,
                moved_from_path: None,
            }),
            (None, None) => None,
        };
    }

    new_rel.map(|path_from_root| ChangeRecord {
        root,
        changed_entry: mutation.entry,
        path_from_root,
        change_type: mutation.change,
        moved_from_path: None,
    })
}

/// Path of `full` relative to `root_path`, or None when out of scope.
/// Non-recursive scope covers the root itself and its direct children.
fn relative_path(
    root_path: &[String],
    full: &[String],
    recursive: bool,
) -> Option<Vec<String>> {
    if full.len() < root_path.len() || !full.starts_with(root_path) {
        return None;
    }
    let rel = &full[root_path.len()..];
    if !recursive && rel.len() > 1 {
        return None;
    }
    Some(rel.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;

    struct CollectingSink {
        records: Mutex<Vec<ChangeRecord>>,
    }

    impl CollectingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                records: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<ChangeRecord> {
            std::mem::take(&mut self.records.lock().unwrap())
        }
    }

    impl ChangeSink for CollectingSink {
        fn on_change_records(&self, records: &[ChangeRecord]) {
            self.records.lock().unwrap().extend_from_slice(records);
        }
    }

    const OBS: ContextId = ContextId(7);

    fn setup() -> (Arc<EntryRegistry>, ChangeObservationHub, EntryId, EntryId) {
        let registry = Arc::new(EntryRegistry::new());
        let root = registry.root();
        let (dir, _) = registry.ensure(root, "dir", EntryKind::Directory).unwrap();
        let hub = ChangeObservationHub::new(registry.clone(), NotifyPolicy::default(), 64);
        (registry, hub, root, dir)
    }

    fn created(entry: EntryId, path: &[&str]) -> RawMutation {
        RawMutation {
            entry,
            change: ChangeType::Created,
            path: path.iter().map(|s| s.to_string()).collect(),
            moved_from: None,
        }
    }

    #[test]
    fn test_recursive_scope_relativizes_paths() {
        let (registry, hub, _root, dir) = setup();
        let (sub, _) = registry.ensure(dir, "sub", EntryKind::Directory).unwrap();
        let (deep, _) = registry.ensure(sub, "deep.txt", EntryKind::File).unwrap();

        let sink = CollectingSink::new();
        hub.observe(OBS, dir, true, sink.clone()).unwrap();
        hub.publish(created(deep, &["dir", "sub", "deep.txt"]));
        hub.flush();

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].root, dir);
        assert_eq!(records[0].changed_entry, deep);
        assert_eq!(records[0].path_from_root, vec!["sub", "deep.txt"]);
        assert_eq!(records[0].change_type, ChangeType::Created);
    }

    #[test]
    fn test_non_recursive_scope_excludes_subdirectories() {
        let (registry, hub, _root, dir) = setup();
        let (sub, _) = registry.ensure(dir, "sub", EntryKind::Directory).unwrap();
        let (deep, _) = registry.ensure(sub, "deep.txt", EntryKind::File).unwrap();
        let (direct, _) = registry.ensure(dir, "x.txt", EntryKind::File).unwrap();

        let sink = CollectingSink::new();
        hub.observe(OBS, dir, false, sink.clone()).unwrap();
        hub.publish(created(deep, &["dir", "sub", "deep.txt"]));
        hub.publish(created(direct, &["dir", "x.txt"]));
        hub.flush();

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].changed_entry, direct);
        assert_eq!(records[0].path_from_root, vec!["x.txt"]);
    }

    #[test]
    fn test_no_records_from_before_observe() {
        let (registry, hub, _root, dir) = setup();
        let (file, _) = registry.ensure(dir, "x.txt", EntryKind::File).unwrap();

        hub.publish(created(file, &["dir", "x.txt"]));
        let sink = CollectingSink::new();
        hub.observe(OBS, dir, true, sink.clone()).unwrap();
        hub.flush();

        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_reobserve_replaces_subscription() {
        let (registry, hub, _root, dir) = setup();
        let (file, _) = registry.ensure(dir, "x.txt", EntryKind::File).unwrap();

        let first = CollectingSink::new();
        let second = CollectingSink::new();
        hub.observe(OBS, dir, true, first.clone()).unwrap();
        hub.observe(OBS, dir, true, second.clone()).unwrap();
        assert_eq!(hub.subscription_count(), 1);

        hub.publish(created(file, &["dir", "x.txt"]));
        hub.flush();

        assert!(first.take().is_empty());
        assert_eq!(second.take().len(), 1);
    }

    #[test]
    fn test_unobserve_stops_delivery() {
        let (registry, hub, _root, dir) = setup();
        let (file, _) = registry.ensure(dir, "x.txt", EntryKind::File).unwrap();

        let sink = CollectingSink::new();
        hub.observe(OBS, dir, true, sink.clone()).unwrap();
        hub.unobserve(OBS, dir);
        hub.publish(created(file, &["dir", "x.txt"]));
        hub.flush();

        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_moved_within_scope_carries_old_path() {
        let (registry, hub, _root, dir) = setup();
        let (file, _) = registry.ensure(dir, "y.txt", EntryKind::File).unwrap();

        let sink = CollectingSink::new();
        hub.observe(OBS, dir, true, sink.clone()).unwrap();
        hub.publish(RawMutation {
            entry: file,
            change: ChangeType::Moved,
            path: vec!["dir".into(), "y.txt".into()],
            moved_from: Some(vec!["dir".into(), "x.txt".into()]),
        });
        hub.flush();

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].change_type, ChangeType::Moved);
        assert_eq!(records[0].path_from_root, vec!["y.txt"]);
        assert_eq!(records[0].moved_from_path, Some(vec!["x.txt".to_string()]));
    }

    #[test]
    fn test_moved_out_of_scope_reported_as_deleted() {
        let (registry, hub, root, dir) = setup();
        let (file, _) = registry.ensure(root, "elsewhere.txt", EntryKind::File).unwrap();

        let sink = CollectingSink::new();
        hub.observe(OBS, dir, true, sink.clone()).unwrap();
        hub.publish(RawMutation {
            entry: file,
            change: ChangeType::Moved,
            path: vec!["elsewhere.txt".into()],
            moved_from: Some(vec!["dir".into(), "x.txt".into()]),
        });
        hub.flush();

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].change_type, ChangeType::Deleted);
        assert_eq!(records[0].path_from_root, vec!["x.txt"]);
        assert_eq!(records[0].moved_from_path, None);
    }

    #[test]
    fn test_errored_subscription_stops_until_reobserved() {
        let (registry, hub, _root, dir) = setup();
        let (file, _) = registry.ensure(dir, "x.txt", EntryKind::File).unwrap();

        let sink = CollectingSink::new();
        hub.observe(OBS, dir, true, sink.clone()).unwrap();
        hub.post_error(dir);
        hub.publish(created(file, &["dir", "x.txt"]));
        hub.flush();

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].change_type, ChangeType::Errored);

        // Fresh observe() re-establishes delivery.
        hub.observe(OBS, dir, true, sink.clone()).unwrap();
        hub.publish(created(file, &["dir", "x.txt"]));
        hub.flush();
        assert_eq!(sink.take().len(), 1);
    }

    #[test]
    fn test_coalesces_modify_burst() {
        let registry = Arc::new(EntryRegistry::new());
        let (dir, _) = registry
            .ensure(registry.root(), "dir", EntryKind::Directory)
            .unwrap();
        let (file, _) = registry.ensure(dir, "x.txt", EntryKind::File).unwrap();
        let policy = NotifyPolicy {
            coalesce_window_ms: 50,
            max_batch: 256,
        };
        let hub = ChangeObservationHub::new(registry, policy, 64);

        let sink = CollectingSink::new();
        hub.observe(OBS, dir, true, sink.clone()).unwrap();
        for _ in 0..8 {
            hub.publish(RawMutation {
                entry: file,
                change: ChangeType::Modified,
                path: vec!["dir".into(), "x.txt".into()],
                moved_from: None,
            });
        }
        hub.flush();

        let records = sink.take();
        assert!(!records.is_empty());
        assert!(records.len() < 8, "burst should coalesce, got {}", records.len());
    }

    #[test]
    fn test_mid_burst_subscriber_sees_later_modification() {
        let registry = Arc::new(EntryRegistry::new());
        let (dir, _) = registry
            .ensure(registry.root(), "dir", EntryKind::Directory)
            .unwrap();
        let (file, _) = registry.ensure(dir, "x.txt", EntryKind::File).unwrap();
        let policy = NotifyPolicy {
            coalesce_window_ms: 50,
            max_batch: 256,
        };
        let hub = ChangeObservationHub::new(registry, policy, 64);

        let modified = || RawMutation {
            entry: file,
            change: ChangeType::Modified,
            path: vec!["dir".into(), "x.txt".into()],
            moved_from: None,
        };

        // The second modify lands after observe(); even if the delivery
        // worker folds it into the pre-observe one, the fence must not
        // swallow it.
        hub.publish(modified());
        let sink = CollectingSink::new();
        hub.observe(OBS, dir, true, sink.clone()).unwrap();
        hub.publish(modified());
        hub.flush();

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].change_type, ChangeType::Modified);
        assert_eq!(records[0].path_from_root, vec!["x.txt"]);
    }

    #[test]
    fn test_subscription_limit() {
        let (registry, hub, root, dir) = setup();
        let hub_small = ChangeObservationHub::new(registry, NotifyPolicy::default(), 1);
        let sink = CollectingSink::new();
        hub_small.observe(OBS, dir, true, sink.clone()).unwrap();
        assert!(matches!(
            hub_small.observe(OBS, root, true, sink.clone()),
            Err(CoreError::TooManySubscriptions)
        ));
        // Replacing an existing subscription is always allowed.
        hub_small.observe(OBS, dir, false, sink).unwrap();
        drop(hub);
    }

    #[test]
    fn test_disconnect_all_clears_observer() {
        let (registry, hub, root, dir) = setup();
        let sink = CollectingSink::new();
        hub.observe(OBS, dir, true, sink.clone()).unwrap();
        hub.observe(OBS, root, true, sink.clone()).unwrap();
        hub.observe(ContextId(9), dir, true, sink).unwrap();
        assert_eq!(hub.subscription_count(), 3);

        hub.disconnect_all(OBS);
        assert_eq!(hub.subscription_count(), 1);
    }
}
