// Copyright 2022 Oxide Computer Company

//! A priority-ordered vector with lock-free readers. The backing array is
//! published as a single epoch pointer; writers rebuild and swap it, so a
//! reader iterating a snapshot sees entries in strictly non-increasing
//! priority order as of some point in time.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};

struct PVec<T>(Box<[(i64, T)]>);

pub(crate) struct PVector<T> {
    vec: Atomic<PVec<T>>,
}

impl<T: Clone> PVector<T> {
    pub(crate) fn new() -> Self {
        Self { vec: Atomic::new(PVec(Vec::new().into_boxed_slice())) }
    }

    /// Snapshot of the entries, highest priority first.
    pub(crate) fn entries<'g>(&self, guard: &'g Guard) -> &'g [(i64, T)] {
        let v = self.vec.load(Ordering::Acquire, guard);
        &unsafe { v.as_ref() }.unwrap().0
    }

    fn publish(&self, entries: Vec<(i64, T)>, guard: &Guard) {
        let old = self.vec.swap(
            Owned::new(PVec(entries.into_boxed_slice())),
            Ordering::Release,
            guard,
        );
        unsafe { guard.defer_destroy(old) };
    }

    /// Writer only. Insert after any existing entries of equal priority.
    pub(crate) fn insert(&self, priority: i64, value: T, guard: &Guard) {
        let cur = self.entries(guard);
        let pos = cur.partition_point(|(p, _)| *p >= priority);
        let mut v: Vec<(i64, T)> = cur.to_vec();
        v.insert(pos, (priority, value));
        self.publish(v, guard);
    }

    /// Writer only. Remove the first entry satisfying `pred`.
    pub(crate) fn remove<F>(&self, guard: &Guard, pred: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        let cur = self.entries(guard);
        let Some(pos) = cur.iter().position(|(_, v)| pred(v)) else {
            return false;
        };
        let mut v: Vec<(i64, T)> = cur.to_vec();
        v.remove(pos);
        self.publish(v, guard);
        true
    }

    /// Writer only. Move the first entry satisfying `pred` to the position
    /// its new priority sorts to.
    pub(crate) fn reprioritize<F>(
        &self,
        priority: i64,
        guard: &Guard,
        pred: F,
    ) -> bool
    where
        F: Fn(&T) -> bool,
    {
        let cur = self.entries(guard);
        let Some(pos) = cur.iter().position(|(_, v)| pred(v)) else {
            return false;
        };
        let mut v: Vec<(i64, T)> = cur.to_vec();
        let (_, value) = v.remove(pos);
        let at = v.partition_point(|(p, _)| *p >= priority);
        v.insert(at, (priority, value));
        self.publish(v, guard);
        true
    }
}

impl<T> Drop for PVector<T> {
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        let v = self.vec.load(Ordering::Relaxed, guard);
        if !v.is_null() {
            drop(unsafe { v.into_owned() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_descending_order() {
        let pv: PVector<&'static str> = PVector::new();
        let guard = &epoch::pin();
        pv.insert(10, "b", guard);
        pv.insert(20, "a", guard);
        pv.insert(5, "d", guard);
        pv.insert(10, "c", guard); // ties go after existing entries
        let got: Vec<_> = pv.entries(guard).iter().cloned().collect();
        assert_eq!(got, vec![(20, "a"), (10, "b"), (10, "c"), (5, "d")]);
    }

    #[test]
    fn reprioritize_moves_entry() {
        let pv: PVector<&'static str> = PVector::new();
        let guard = &epoch::pin();
        pv.insert(1, "x", guard);
        pv.insert(2, "y", guard);
        assert!(pv.reprioritize(3, guard, |v| *v == "x"));
        assert_eq!(pv.entries(guard)[0], (3, "x"));
        assert!(pv.remove(guard, |v| *v == "x"));
        assert_eq!(pv.entries(guard).len(), 1);
    }
}
