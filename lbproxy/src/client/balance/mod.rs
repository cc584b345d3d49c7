// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! load balance for channel.

mod round_robin;
pub use round_robin::RoundRobin;

/// [`LoadBalance`] promise the feature of the load balance policy.
pub trait LoadBalance<C>: Send + Sync + 'static {
    /// `select` returns the channel the next call goes to, `None` if there is none.
    fn select(&self) -> Option<C>;
    /// `rebalance` replaces the whole channel set, keeping the given order.
    fn rebalance(&self, channels: Vec<C>);
    /// Number of channels currently balanced over.
    fn len(&self) -> usize;
    /// Whether there is no channel to balance over.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
