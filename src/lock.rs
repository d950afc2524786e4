//! Multi-reader/single-writer lock with an explicit write-to-read downgrade.
//!
//! Every volume and every dentry carries one of these. The extra surface over
//! a stock `RwLock` is deliberate:
//!
//! - `write_long` flags the critical section as long-running (a raw tape
//!   write can block for minutes), and `read_short` lets latency-sensitive
//!   readers bail out instead of queueing behind it.
//! - `write_to_read` downgrades without releasing, so a writer can publish
//!   state and keep it stable while continuing as a reader. The downgrade is
//!   atomic with respect to other writers but intentionally lets queued
//!   readers in, which is observable and relied upon by the raw write path.

use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

#[derive(Default)]
struct State {
    readers: usize,
    writer: bool,
    writer_is_long: bool,
    writers_waiting: usize,
    long_writers_waiting: usize,
}

pub struct Mrsw<T: ?Sized> {
    state: Mutex<State>,
    cond: Condvar,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mrsw<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Mrsw<T> {}

impl<T> Mrsw<T> {
    pub fn new(data: T) -> Self {
        Mrsw {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mrsw<T> {
    /// Shared acquire; waits out writers and queued writers.
    pub fn read(&self) -> MrswReadGuard<'_, T> {
        let mut st = self.state.lock();
        while st.writer || st.writers_waiting > 0 {
            self.cond.wait(&mut st);
        }
        st.readers += 1;
        MrswReadGuard { lock: self }
    }

    /// Shared acquire that refuses to queue behind a long writer.
    ///
    /// Returns `None` when a long write is held or pending; callers surface
    /// that as a restartable condition rather than stalling.
    pub fn read_short(&self) -> Option<MrswReadGuard<'_, T>> {
        let mut st = self.state.lock();
        loop {
            if (st.writer && st.writer_is_long) || st.long_writers_waiting > 0 {
                return None;
            }
            if !st.writer && st.writers_waiting == 0 {
                st.readers += 1;
                return Some(MrswReadGuard { lock: self });
            }
            self.cond.wait(&mut st);
        }
    }

    pub fn write(&self) -> MrswWriteGuard<'_, T> {
        self.write_internal(false)
    }

    /// Exclusive acquire for a long critical section (tape I/O held across
    /// it). `read_short` callers will see the flag and back off.
    pub fn write_long(&self) -> MrswWriteGuard<'_, T> {
        self.write_internal(true)
    }

    fn write_internal(&self, long: bool) -> MrswWriteGuard<'_, T> {
        let mut st = self.state.lock();
        st.writers_waiting += 1;
        if long {
            st.long_writers_waiting += 1;
        }
        while st.writer || st.readers > 0 {
            self.cond.wait(&mut st);
        }
        st.writers_waiting -= 1;
        if long {
            st.long_writers_waiting -= 1;
        }
        st.writer = true;
        st.writer_is_long = long;
        MrswWriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Option<MrswWriteGuard<'_, T>> {
        let mut st = self.state.lock();
        if st.writer || st.readers > 0 {
            return None;
        }
        st.writer = true;
        st.writer_is_long = false;
        Some(MrswWriteGuard { lock: self })
    }

    /// Downgrade an exclusive guard to a shared one without a release window
    /// for other writers.
    pub fn write_to_read(guard: MrswWriteGuard<'_, T>) -> MrswReadGuard<'_, T> {
        let lock = guard.lock;
        std::mem::forget(guard);
        let mut st = lock.state.lock();
        st.writer = false;
        st.writer_is_long = false;
        st.readers += 1;
        lock.cond.notify_all();
        MrswReadGuard { lock }
    }

    fn release_read(&self) {
        let mut st = self.state.lock();
        st.readers -= 1;
        if st.readers == 0 {
            self.cond.notify_all();
        }
    }

    fn release_write(&self) {
        let mut st = self.state.lock();
        st.writer = false;
        st.writer_is_long = false;
        self.cond.notify_all();
    }
}

pub struct MrswReadGuard<'a, T: ?Sized> {
    lock: &'a Mrsw<T>,
}

impl<T: ?Sized> Deref for MrswReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MrswReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

pub struct MrswWriteGuard<'a, T: ?Sized> {
    lock: &'a Mrsw<T>,
}

impl<T: ?Sized> Deref for MrswWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MrswWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MrswWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share() {
        let lock = Mrsw::new(5u32);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 10);
    }

    #[test]
    fn try_write_fails_under_reader() {
        let lock = Mrsw::new(0u32);
        let _r = lock.read();
        assert!(lock.try_write().is_none());
    }

    #[test]
    fn write_to_read_keeps_value_stable() {
        let lock = Arc::new(Mrsw::new(0u32));
        let mut w = lock.write();
        *w = 7;
        let r = Mrsw::write_to_read(w);
        assert_eq!(*r, 7);
        // Another reader can join while the downgraded guard is held.
        let r2 = lock.read();
        assert_eq!(*r2, 7);
    }

    #[test]
    fn read_short_backs_off_from_long_writer() {
        let lock = Arc::new(Mrsw::new(0u32));
        let held = lock.write_long();
        assert!(lock.read_short().is_none());
        drop(held);
        assert!(lock.read_short().is_some());
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = Arc::new(Mrsw::new(0u32));
        let mut w = lock.write();
        *w = 1;
        let lock2 = Arc::clone(&lock);
        let t = thread::spawn(move || {
            let r = lock2.read();
            *r
        });
        thread::sleep(Duration::from_millis(20));
        *w = 2;
        drop(w);
        assert_eq!(t.join().unwrap(), 2);
    }
}
