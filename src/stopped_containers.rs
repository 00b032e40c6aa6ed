use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use crate::{data_model::ContainerId, utils::time::get_epoch_time_in_ms};

/// Insertion-ordered record of recently completed container ids.
///
/// Entries expire `retention_ms` after insertion. Because the retention is
/// fixed for the process, insertion order is monotonic in expiry, so the GC
/// walk can stop at the first entry whose expiry has not yet passed.
pub struct RecentlyStoppedCache {
    retention_ms: u64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    order: VecDeque<ContainerId>,
    expiries: HashMap<ContainerId, u64>,
}

impl RecentlyStoppedCache {
    pub fn new(retention_ms: u64) -> Self {
        Self {
            retention_ms,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Remembers a completed container. Re-inserting an id already present
    /// keeps its original expiry.
    pub fn insert(&self, container_id: &ContainerId) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.expiries.contains_key(container_id) {
            let expiry = get_epoch_time_in_ms() + self.retention_ms;
            inner.order.push_back(container_id.clone());
            inner.expiries.insert(container_id.clone(), expiry);
        }
    }

    pub fn contains(&self, container_id: &ContainerId) -> bool {
        self.inner.lock().unwrap().expiries.contains_key(container_id)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.order.clear();
        inner.expiries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired entries, walking from the oldest end and stopping at the
    /// first entry whose expiry is still in the future. An expired entry is
    /// only removed once `eligible` confirms it (its container left the live
    /// map and its application stopped); others stay until a later pass.
    ///
    /// The eligibility and removal callbacks run without the cache lock held,
    /// so they are free to consult the container map.
    pub fn gc(
        &self,
        mut eligible: impl FnMut(&ContainerId) -> bool,
        mut on_remove: impl FnMut(&ContainerId),
    ) {
        let now = get_epoch_time_in_ms();
        let candidates: Vec<ContainerId> = {
            let inner = self.inner.lock().unwrap();
            inner
                .order
                .iter()
                .take_while(|id| inner.expiries[*id] < now)
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return;
        }

        let removable: Vec<ContainerId> =
            candidates.into_iter().filter(|id| eligible(id)).collect();
        {
            let mut inner = self.inner.lock().unwrap();
            for id in &removable {
                inner.expiries.remove(id);
            }
            inner.order.retain(|id| !removable.contains(id));
        }
        for id in &removable {
            on_remove(id);
        }
    }
}
