//! Epoch-stamped visited tracking for graph traversal.
//!
//! Clearing between searches advances an epoch counter instead of zeroing
//! the whole array; membership is one array read and compare. Sets are
//! pooled per thread so repeated searches reuse their allocation.

use std::cell::RefCell;

thread_local! {
    static POOL: RefCell<Vec<VisitedSet>> = const { RefCell::new(Vec::new()) };
}

const POOL_LIMIT: usize = 4;

pub(super) struct VisitedSet {
    epochs: Vec<u32>,
    epoch: u32,
}

impl VisitedSet {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            epochs: vec![0; capacity.max(64)],
            epoch: 1,
        }
    }

    #[inline(always)]
    pub fn is_visited(&self, slot: u32) -> bool {
        let slot = slot as usize;
        slot < self.epochs.len() && self.epochs[slot] == self.epoch
    }

    #[inline(always)]
    pub fn visit(&mut self, slot: u32) {
        let slot = slot as usize;
        if slot >= self.epochs.len() {
            let new_len = (slot + 1).next_power_of_two().max(64);
            self.epochs.resize(new_len, 0);
        }
        self.epochs[slot] = self.epoch;
    }

    fn advance(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            // Epoch wrapped; stale stamps could alias, so hard-reset.
            self.epochs.fill(0);
            self.epoch = 1;
        }
    }
}

/// RAII borrow from the thread-local pool; returns the set on drop.
pub(super) struct VisitedGuard {
    set: Option<VisitedSet>,
}

impl VisitedGuard {
    pub fn new(capacity: usize) -> Self {
        let set = POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            let mut set = match pool
                .iter()
                .position(|s| s.epochs.len() >= capacity)
            {
                Some(idx) => pool.swap_remove(idx),
                None => VisitedSet::with_capacity(capacity),
            };
            set.advance();
            set
        });
        Self { set: Some(set) }
    }
}

impl Drop for VisitedGuard {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            POOL.with(|pool| {
                let mut pool = pool.borrow_mut();
                if pool.len() < POOL_LIMIT {
                    pool.push(set);
                }
            });
        }
    }
}

impl std::ops::Deref for VisitedGuard {
    type Target = VisitedSet;

    fn deref(&self) -> &Self::Target {
        self.set.as_ref().expect("visited set present until drop")
    }
}

impl std::ops::DerefMut for VisitedGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.set.as_mut().expect("visited set present until drop")
    }
}
