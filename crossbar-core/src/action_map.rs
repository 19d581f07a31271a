//! Deadline-ordered storage for deferred actions
//!
//! The common case is a handful of outstanding timers, so up to
//! [`INLINE_SLOTS`] entries live in an inline vector that is scanned
//! linearly; everything beyond spills into an ordered map. The picked
//! action is always the globally-earliest across both, ties resolved in
//! insertion order.

use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::time::Instant;

/// A deferred nullary action.
pub type Action = Box<dyn FnOnce() + Send>;

/// Inline entries scanned before consulting the overflow map.
pub const INLINE_SLOTS: usize = 20;

#[derive(Default)]
pub struct ActionMap {
    inline: SmallVec<[(Instant, u64, Action); INLINE_SLOTS]>,
    overflow: BTreeMap<(Instant, u64), Action>,
    next_seq: u64,
}

impl ActionMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action due at `deadline`.
    pub fn insert(&mut self, deadline: Instant, action: Action) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.overflow.is_empty() && self.inline.len() < INLINE_SLOTS {
            self.inline.push((deadline, seq, action));
        } else {
            self.overflow.insert((deadline, seq), action);
        }
    }

    /// Earliest deadline present, if any.
    #[must_use]
    pub fn next_time_point(&self) -> Option<Instant> {
        let inline_min = self.inline.iter().map(|(pt, _, _)| *pt).min();
        let overflow_min = self.overflow.keys().next().map(|(pt, _)| *pt);
        match (inline_min, overflow_min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Remove and return the action with the smallest deadline.
    ///
    /// Ties are broken by insertion order across inline and overflow
    /// storage.
    pub fn pick_action(&mut self) -> Option<Action> {
        let inline_min = self
            .inline
            .iter()
            .enumerate()
            .min_by_key(|(_, (pt, seq, _))| (*pt, *seq))
            .map(|(idx, (pt, seq, _))| (idx, (*pt, *seq)));
        let overflow_min = self.overflow.keys().next().copied();

        match (inline_min, overflow_min) {
            (Some((idx, key)), Some(okey)) if key <= okey => {
                Some(self.inline.swap_remove(idx).2)
            }
            (Some(_), Some(okey)) => self.overflow.remove(&okey),
            (Some((idx, _)), None) => Some(self.inline.swap_remove(idx).2),
            (None, Some(okey)) => self.overflow.remove(&okey),
            (None, None) => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inline.len() + self.overflow.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inline.is_empty() && self.overflow.is_empty()
    }
}
