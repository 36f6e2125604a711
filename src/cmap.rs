// Copyright 2022 Oxide Computer Company

//! A hash map with lock-free readers and a single serialized writer.
//!
//! Readers pin an epoch and walk an atomically published bucket array;
//! every mutation replaces the affected bucket (or, on growth, the whole
//! array) wholesale and retires the displaced storage, so a reader always
//! observes a bucket that was complete at some point in time. Writers must
//! be serialized externally; nothing here takes a lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

const MIN_BUCKETS: usize = 8;
/// Grow when entries exceed buckets times this.
const GROW_FILL: usize = 2;

struct Bucket<T>(Box<[(u64, T)]>);

struct Table<T> {
    mask: u64,
    buckets: Box<[Atomic<Bucket<T>>]>,
}

impl<T> Table<T> {
    fn with_buckets(n: usize) -> Self {
        debug_assert!(n.is_power_of_two());
        Self {
            mask: (n - 1) as u64,
            buckets: (0..n).map(|_| Atomic::null()).collect(),
        }
    }

    fn slot(&self, hash: u64) -> &Atomic<Bucket<T>> {
        &self.buckets[(hash & self.mask) as usize]
    }
}

pub(crate) struct CMap<T> {
    table: Atomic<Table<T>>,
    count: AtomicUsize,
}

impl<T: Clone> CMap<T> {
    pub(crate) fn new() -> Self {
        Self {
            table: Atomic::new(Table::with_buckets(MIN_BUCKETS)),
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table<'g>(&self, guard: &'g Guard) -> &'g Table<T> {
        let t = self.table.load(Ordering::Acquire, guard);
        unsafe { t.as_ref() }.unwrap()
    }

    /// First entry with this hash satisfying `pred`.
    pub(crate) fn find<'g, F>(
        &self,
        hash: u64,
        guard: &'g Guard,
        pred: F,
    ) -> Option<&'g T>
    where
        F: Fn(&T) -> bool,
    {
        let table = self.table(guard);
        let b = table.slot(hash).load(Ordering::Acquire, guard);
        let bucket = unsafe { b.as_ref() }?;
        bucket
            .0
            .iter()
            .filter(|(h, _)| *h == hash)
            .map(|(_, v)| v)
            .find(|v| pred(v))
    }

    /// Writer only. Inserts without checking for duplicates.
    pub(crate) fn insert(&self, hash: u64, value: T, guard: &Guard) {
        if self.len() + 1 > (self.table(guard).mask as usize + 1) * GROW_FILL
        {
            self.grow(guard);
        }
        let table = self.table(guard);
        let slot = table.slot(hash);
        let cur = slot.load(Ordering::Acquire, guard);
        let mut entries: Vec<(u64, T)> = match unsafe { cur.as_ref() } {
            Some(b) => b.0.to_vec(),
            None => Vec::with_capacity(1),
        };
        entries.push((hash, value));
        slot.store(
            Owned::new(Bucket(entries.into_boxed_slice())),
            Ordering::Release,
        );
        if !cur.is_null() {
            unsafe { guard.defer_destroy(cur) };
        }
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Writer only. Removes the first entry with this hash satisfying
    /// `pred`. Returns whether an entry was removed.
    pub(crate) fn remove<F>(&self, hash: u64, guard: &Guard, pred: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        let table = self.table(guard);
        let slot = table.slot(hash);
        let cur = slot.load(Ordering::Acquire, guard);
        let Some(bucket) = (unsafe { cur.as_ref() }) else {
            return false;
        };
        let Some(pos) = bucket
            .0
            .iter()
            .position(|(h, v)| *h == hash && pred(v))
        else {
            return false;
        };
        if bucket.0.len() == 1 {
            slot.store(Shared::null(), Ordering::Release);
        } else {
            let entries: Vec<(u64, T)> = bucket
                .0
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != pos)
                .map(|(_, e)| e.clone())
                .collect();
            slot.store(
                Owned::new(Bucket(entries.into_boxed_slice())),
                Ordering::Release,
            );
        }
        unsafe { guard.defer_destroy(cur) };
        self.count.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Writer only. Replaces the value of the first entry with this hash
    /// satisfying `pred`. Returns whether a replacement happened.
    pub(crate) fn replace<F>(
        &self,
        hash: u64,
        guard: &Guard,
        pred: F,
        value: T,
    ) -> bool
    where
        F: Fn(&T) -> bool,
    {
        let table = self.table(guard);
        let slot = table.slot(hash);
        let cur = slot.load(Ordering::Acquire, guard);
        let Some(bucket) = (unsafe { cur.as_ref() }) else {
            return false;
        };
        let Some(pos) = bucket
            .0
            .iter()
            .position(|(h, v)| *h == hash && pred(v))
        else {
            return false;
        };
        let mut entries: Vec<(u64, T)> = bucket.0.to_vec();
        entries[pos] = (hash, value);
        slot.store(
            Owned::new(Bucket(entries.into_boxed_slice())),
            Ordering::Release,
        );
        unsafe { guard.defer_destroy(cur) };
        true
    }

    fn grow(&self, guard: &Guard) {
        let old = self.table.load(Ordering::Acquire, guard);
        let old_table = unsafe { old.as_ref() }.unwrap();
        let n = (old_table.mask as usize + 1) * 2;
        let new = Table::with_buckets(n);
        let mut vecs: Vec<Vec<(u64, T)>> = (0..n).map(|_| Vec::new()).collect();
        for slot in old_table.buckets.iter() {
            let b = slot.load(Ordering::Acquire, guard);
            if let Some(bucket) = unsafe { b.as_ref() } {
                for (h, v) in bucket.0.iter() {
                    vecs[(h & new.mask) as usize].push((*h, v.clone()));
                }
                unsafe { guard.defer_destroy(b) };
            }
        }
        for (i, v) in vecs.into_iter().enumerate() {
            if !v.is_empty() {
                new.buckets[i].store(
                    Owned::new(Bucket(v.into_boxed_slice())),
                    Ordering::Relaxed,
                );
            }
        }
        self.table.store(Owned::new(new), Ordering::Release);
        unsafe { guard.defer_destroy(old) };
    }

    pub(crate) fn iter<'g>(&self, guard: &'g Guard) -> Iter<'g, T> {
        Iter {
            table: self.table(guard),
            guard,
            bucket: None,
            bi: 0,
            ei: 0,
        }
    }
}

pub(crate) struct Iter<'g, T> {
    table: &'g Table<T>,
    guard: &'g Guard,
    bucket: Option<&'g Bucket<T>>,
    bi: usize,
    ei: usize,
}

impl<'g, T> Iterator for Iter<'g, T> {
    type Item = &'g T;

    fn next(&mut self) -> Option<&'g T> {
        loop {
            if let Some(b) = self.bucket {
                if self.ei < b.0.len() {
                    let v = &b.0[self.ei].1;
                    self.ei += 1;
                    return Some(v);
                }
                self.bucket = None;
            }
            if self.bi >= self.table.buckets.len() {
                return None;
            }
            let b = self.table.buckets[self.bi]
                .load(Ordering::Acquire, self.guard);
            self.bi += 1;
            self.ei = 0;
            self.bucket = unsafe { b.as_ref() };
        }
    }
}

impl<T> Drop for CMap<T> {
    fn drop(&mut self) {
        // Exclusive access: free everything directly.
        let guard = unsafe { epoch::unprotected() };
        let t = self.table.load(Ordering::Relaxed, guard);
        if let Some(table) = unsafe { t.as_ref() } {
            for slot in table.buckets.iter() {
                let b = slot.load(Ordering::Relaxed, guard);
                if !b.is_null() {
                    drop(unsafe { b.into_owned() });
                }
            }
        }
        if !t.is_null() {
            drop(unsafe { t.into_owned() });
        }
    }
}
