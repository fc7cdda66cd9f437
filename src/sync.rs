// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! A writer- or reader-preferring RW lock with movable unique-lock guards,
//! reimplementing the internal state machine of the original's
//! `rw_mutex.hpp` on top of `std::sync::{Mutex, Condvar}`.

use std::sync::{Arc, Condvar, Mutex};

struct State {
    prefer_reader: bool,
    read_count: u32,
    write_count: u32,
    reading_count: u32,
    writing: bool,
}

/// Reader/writer preferring RW lock. Unlike `std::sync::RwLock`, unlock
/// bookkeeping is per-guard: a guard only ever releases the balance *it*
/// acquired, which is what makes `UniqueReadLock`/`UniqueWriteLock`/
/// `UniqueRwLock` safely movable.
pub struct RwMutex {
    state: Mutex<State>,
    read_cv: Condvar,
    write_cv: Condvar,
}

impl RwMutex {
    pub fn new() -> Arc<Self> {
        Self::with_preference(true)
    }

    pub fn new_writer_preferring() -> Arc<Self> {
        Self::with_preference(false)
    }

    fn with_preference(prefer_reader: bool) -> Arc<Self> {
        Arc::new(RwMutex {
            state: Mutex::new(State {
                prefer_reader,
                read_count: 0,
                write_count: 0,
                reading_count: 0,
                writing: false,
            }),
            read_cv: Condvar::new(),
            write_cv: Condvar::new(),
        })
    }

    /// Blocks until a read slot is available, then holds it. `count` and
    /// `reading`, if given, are incremented so the caller's guard can later
    /// release exactly the balance it owns.
    fn read_lock(&self, count: &mut u32, reading: &mut u32) {
        let mut st = self.state.lock().unwrap();
        st.read_count += 1;
        *count += 1;

        let prefer_reader = st.prefer_reader;
        st = self
            .read_cv
            .wait_while(st, |s| {
                if prefer_reader {
                    s.writing
                } else {
                    s.write_count > 0
                }
            })
            .unwrap();

        st.reading_count += 1;
        *reading += 1;
    }

    fn read_unlock(&self, count: &mut u32, reading: &mut u32, release: bool) {
        let mut st = self.state.lock().unwrap();
        if release {
            st.read_count = st.read_count.saturating_sub(*count);
            st.reading_count = st.reading_count.saturating_sub(*reading);
            *count = 0;
            *reading = 0;
        } else {
            if *count > 0 {
                st.read_count = st.read_count.saturating_sub(1);
                *count -= 1;
            }
            if *reading > 0 {
                st.reading_count = st.reading_count.saturating_sub(1);
                *reading -= 1;
            }
        }

        if st.reading_count == 0 {
            drop(st);
            self.write_cv.notify_one();
        }
    }

    fn write_lock(&self, count: &mut u32) {
        let mut st = self.state.lock().unwrap();
        st.write_count += 1;
        *count += 1;

        st = self
            .write_cv
            .wait_while(st, |s| {
                let may_enter = if s.prefer_reader {
                    s.read_count == 0
                } else {
                    s.reading_count == 0
                };
                !(may_enter && !s.writing)
            })
            .unwrap();

        st.writing = true;
    }

    fn write_unlock(&self, count: &mut u32, release: bool) {
        let mut st = self.state.lock().unwrap();
        st.writing = false;

        if release {
            st.write_count = st.write_count.saturating_sub(*count);
            *count = 0;
        } else if *count > 0 {
            st.write_count = st.write_count.saturating_sub(1);
            *count -= 1;
        }

        let prefer_reader = st.prefer_reader;
        drop(st);
        if prefer_reader {
            self.read_cv.notify_all();
        } else {
            self.write_cv.notify_one();
        }
    }

    pub fn read_guard(self: &Arc<Self>) -> UniqueReadLock {
        let mut g = UniqueReadLock {
            mutex: self.clone(),
            count: 0,
            reading: 0,
        };
        self.read_lock(&mut g.count, &mut g.reading);
        g
    }

    pub fn write_guard(self: &Arc<Self>) -> UniqueWriteLock {
        let mut g = UniqueWriteLock {
            mutex: self.clone(),
            count: 0,
        };
        self.write_lock(&mut g.count);
        g
    }

    pub fn rw_guard(self: &Arc<Self>) -> UniqueRwLock {
        UniqueRwLock {
            mutex: self.clone(),
            read_count: 0,
            reading_count: 0,
            write_count: 0,
        }
    }
}

/// Move-only read-lock guard. Tracks only the lock balance it personally
/// owns; dropping it releases exactly that balance, not the mutex's entire
/// reader state.
pub struct UniqueReadLock {
    mutex: Arc<RwMutex>,
    count: u32,
    reading: u32,
}

impl Drop for UniqueReadLock {
    fn drop(&mut self) {
        self.mutex.read_unlock(&mut self.count, &mut self.reading, true);
    }
}

/// Move-only write-lock guard, same ownership discipline as `UniqueReadLock`.
pub struct UniqueWriteLock {
    mutex: Arc<RwMutex>,
    count: u32,
}

impl Drop for UniqueWriteLock {
    fn drop(&mut self) {
        self.mutex.write_unlock(&mut self.count, true);
    }
}

/// A guard that may hold zero, one read lock, or one write lock at a time,
/// and can convert between the two without losing its place relative to
/// other waiters.
pub struct UniqueRwLock {
    mutex: Arc<RwMutex>,
    read_count: u32,
    reading_count: u32,
    write_count: u32,
}

impl UniqueRwLock {
    pub fn lock_read(&mut self) {
        debug_assert_eq!(self.write_count, 0, "already holding a write lock");
        self.mutex.read_lock(&mut self.read_count, &mut self.reading_count);
    }

    pub fn unlock_read(&mut self) {
        self.mutex
            .read_unlock(&mut self.read_count, &mut self.reading_count, true);
    }

    pub fn lock_write(&mut self) {
        debug_assert_eq!(self.reading_count, 0, "already holding a read lock");
        self.mutex.write_lock(&mut self.write_count);
    }

    pub fn unlock_write(&mut self) {
        self.mutex.write_unlock(&mut self.write_count, true);
    }
}

impl Drop for UniqueRwLock {
    fn drop(&mut self) {
        if self.write_count > 0 {
            self.mutex.write_unlock(&mut self.write_count, true);
        }
        if self.read_count > 0 || self.reading_count > 0 {
            self.mutex
                .read_unlock(&mut self.read_count, &mut self.reading_count, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn concurrent_readers_allowed() {
        let mtx = RwMutex::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mtx = mtx.clone();
                let active = active.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    let _g = mtx.read_guard();
                    let cur = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(cur, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn writer_excludes_readers() {
        let mtx = RwMutex::new();
        let flag = Arc::new(AtomicUsize::new(0));

        let w_mtx = mtx.clone();
        let w_flag = flag.clone();
        let writer = thread::spawn(move || {
            let _g = w_mtx.write_guard();
            w_flag.store(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            w_flag.store(0, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(5));
        let _g = mtx.read_guard();
        assert_eq!(flag.load(Ordering::SeqCst), 0);
        writer.join().unwrap();
    }

    #[test]
    fn guard_move_transfers_balance() {
        let mtx = RwMutex::new();
        let g = mtx.read_guard();
        let moved = g;
        drop(moved);

        // a writer can now proceed without deadlocking.
        let _wg = mtx.write_guard();
    }
}
