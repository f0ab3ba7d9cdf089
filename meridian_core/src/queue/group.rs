use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// A claimed head-of-group item. The group stays locked (no other worker can
/// claim from it) until this claim is committed or the stale-lock sweeper
/// reclaims it.
#[derive(Debug)]
pub struct GroupClaim<T> {
    pub group: String,
    pub item: T,
    generation: u64,
}

struct GroupState<T> {
    items: VecDeque<T>,
    /// Lock instant while a worker holds an uncommitted claim.
    locked_at: Option<Instant>,
    /// Bumped on every acquire and sweep so a stale commit cannot pop an
    /// item that was re-offered to another worker.
    generation: u64,
}

struct Inner<T> {
    groups: Mutex<BTreeMap<String, GroupState<T>>>,
    available: Notify,
    lock_timeout: Duration,
}

/// FIFO queue that serializes work within a group key while letting distinct
/// groups proceed concurrently.
///
/// `get` returns the head of any unlocked non-empty group and locks that
/// group; `commit` advances the group's cursor and unlocks it. A background
/// sweep releases locks older than the configured timeout (a worker that
/// crashed mid-processing) and re-offers that group's head item, preserving
/// at-least-once semantics.
pub struct GroupQueue<T> {
    inner: Arc<Inner<T>>,
    sweeper: JoinHandle<()>,
}

impl<T: Clone + Send + 'static> GroupQueue<T> {
    pub fn new(lock_timeout: Duration, sweep_interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            groups: Mutex::new(BTreeMap::new()),
            available: Notify::new(),
            lock_timeout,
        });
        let sweeper = tokio::spawn(Self::run_sweeper(inner.clone(), sweep_interval));
        Self { inner, sweeper }
    }

    async fn run_sweeper(inner: Arc<Inner<T>>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            let mut groups = inner.groups.lock().await;
            let mut released = false;
            for (name, state) in groups.iter_mut() {
                let Some(locked_at) = state.locked_at else {
                    continue;
                };
                if locked_at.elapsed() < inner.lock_timeout {
                    continue;
                }
                tracing::warn!(
                    group = %name,
                    held_for_secs = locked_at.elapsed().as_secs(),
                    "group lock timed out; releasing and re-offering head item"
                );
                state.locked_at = None;
                state.generation += 1;
                released = true;
            }
            drop(groups);
            if released {
                inner.available.notify_waiters();
            }
        }
    }

    pub async fn put(&self, group: impl Into<String>, item: T) -> Result<()> {
        let group = group.into();
        if group.trim().is_empty() {
            return Err(Error::InvalidInput("group key is empty".to_string()));
        }
        let mut groups = self.inner.groups.lock().await;
        groups
            .entry(group)
            .or_insert_with(|| GroupState {
                items: VecDeque::new(),
                locked_at: None,
                generation: 0,
            })
            .items
            .push_back(item);
        drop(groups);
        self.inner.available.notify_one();
        Ok(())
    }

    /// Claim the head of any unlocked group, suspending until one exists.
    pub async fn get(&self) -> Result<GroupClaim<T>> {
        loop {
            {
                let mut groups = self.inner.groups.lock().await;
                for (name, state) in groups.iter_mut() {
                    if state.locked_at.is_some() {
                        continue;
                    }
                    // The head stays queued until commit so a swept lock can
                    // re-offer it.
                    let Some(item) = state.items.front().cloned() else {
                        continue;
                    };
                    state.locked_at = Some(Instant::now());
                    state.generation += 1;
                    return Ok(GroupClaim {
                        group: name.clone(),
                        item,
                        generation: state.generation,
                    });
                }
            }
            let _ =
                tokio::time::timeout(Duration::from_millis(50), self.inner.available.notified())
                    .await;
        }
    }

    pub async fn get_timeout(&self, wait: Duration) -> Result<Option<GroupClaim<T>>> {
        match tokio::time::timeout(wait, self.get()).await {
            Ok(claim) => claim.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Advance the claimed group's cursor and unlock it.
    ///
    /// A claim whose lock was already swept is ignored with a warning; the
    /// item was re-offered and belongs to another worker now.
    pub async fn commit(&self, claim: GroupClaim<T>) -> Result<()> {
        let mut groups = self.inner.groups.lock().await;
        let Some(state) = groups.get_mut(&claim.group) else {
            return Err(Error::NotFound(format!("group '{}'", claim.group)));
        };
        if state.locked_at.is_none() || state.generation != claim.generation {
            tracing::warn!(
                group = %claim.group,
                "commit for a swept group lock; item was re-offered, skipping"
            );
            return Ok(());
        }
        state.items.pop_front();
        state.locked_at = None;
        if state.items.is_empty() {
            groups.remove(&claim.group);
        }
        drop(groups);
        self.inner.available.notify_waiters();
        Ok(())
    }

    pub async fn size(&self) -> usize {
        let groups = self.inner.groups.lock().await;
        groups.values().map(|g| g.items.len()).sum()
    }

    /// Suspend until all groups are empty and unlocked.
    pub async fn teardown(&self) -> Result<()> {
        loop {
            {
                let groups = self.inner.groups.lock().await;
                let busy = groups
                    .values()
                    .any(|g| !g.items.is_empty() || g.locked_at.is_some());
                if !busy {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl<T> Drop for GroupQueue<T> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
