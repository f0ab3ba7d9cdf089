use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::traits::Queue;
use crate::Result;

/// Unbounded in-memory FIFO with drain tracking.
///
/// `commit` marks one unit of work done so `teardown` can wait for both the
/// backlog and the in-flight item of the consuming loop.
pub struct MemoryQueue<T> {
    state: Arc<Mutex<State<T>>>,
    available: Arc<Notify>,
}

struct State<T> {
    items: VecDeque<T>,
    in_flight: usize,
}

impl<T> Default for MemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemoryQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                items: VecDeque::new(),
                in_flight: 0,
            })),
            available: Arc::new(Notify::new()),
        }
    }
}

impl<T> Clone for MemoryQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            available: self.available.clone(),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Queue<T> for MemoryQueue<T> {
    async fn put(&self, item: T) -> Result<()> {
        self.state.lock().await.items.push_back(item);
        self.available.notify_one();
        Ok(())
    }

    async fn get(&self) -> Result<T> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(item) = state.items.pop_front() {
                    state.in_flight += 1;
                    return Ok(item);
                }
            }
            // Re-check periodically so a notify racing the lock release is
            // never lost for longer than one tick.
            let _ = tokio::time::timeout(Duration::from_millis(50), self.available.notified()).await;
        }
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        Ok(())
    }

    async fn size(&self) -> usize {
        self.state.lock().await.items.len()
    }

    async fn teardown(&self) -> Result<()> {
        loop {
            {
                let state = self.state.lock().await;
                if state.items.is_empty() && state.in_flight == 0 {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
