// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Round-robin load balance implemention

use super::LoadBalance;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Unweighted round-robin over an ordered channel list.
///
/// Every `N` consecutive selections return each of the `N` channels exactly
/// once, in list order, no matter how many callers race on [`RoundRobin::select`].
/// Channel health is not considered.
#[derive(Debug)]
pub struct RoundRobin<C> {
    channels: RwLock<Arc<Vec<C>>>,
    cursor: AtomicUsize,
}

impl<C> RoundRobin<C> {
    /// Returns a [`RoundRobin`] starting at the first channel.
    pub fn new(channels: Vec<C>) -> Self {
        Self {
            channels: RwLock::new(Arc::new(channels)),
            cursor: AtomicUsize::new(0),
        }
    }

    /// The channel list as of now.
    pub fn snapshot(&self) -> Arc<Vec<C>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Claims the next index of a list of `n` channels.
    ///
    /// Reading the cursor and advancing it is one compare-and-swap, so no two
    /// callers observe the same index within a cycle.
    fn next_index(&self, n: usize) -> usize {
        let prev = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| Some((i % n + 1) % n))
            .unwrap_or_else(|i| i);
        prev % n
    }
}

impl<C> Default for RoundRobin<C> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<C> LoadBalance<C> for RoundRobin<C>
where
    C: Clone + Send + Sync + 'static,
{
    fn select(&self) -> Option<C> {
        let channels = self.snapshot();
        if channels.is_empty() {
            return None;
        }
        let index = self.next_index(channels.len());
        Some(channels[index].clone())
    }

    fn rebalance(&self, channels: Vec<C>) {
        *self.channels.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(channels);
    }

    fn len(&self) -> usize {
        self.snapshot().len()
    }
}
