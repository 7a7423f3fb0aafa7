//! Thread-id to buffer resolution.
//!
//! A 65536-slot direct-mapped table indexed by the low bits of the kernel
//! thread id, with linear probing on collision. Slots are allocated on a
//! thread's first emit and owned by the table until the engine is torn down;
//! a buffer therefore survives its thread, which is what lets a flush collect
//! events from workers that have already joined.
//!
//! The hot path never touches the table: a thread-local cache keyed on the
//! engine instance resolves repeat lookups in two loads.

use crate::buffer::EventBuffer;
use std::cell::Cell;
use std::sync::atomic::{AtomicPtr, Ordering};

pub(crate) const REGISTRY_SLOTS: usize = 1 << 16;

/// Kernel thread id of the calling thread.
#[cfg(target_os = "linux")]
pub(crate) fn current_tid() -> u64 {
    // SAFETY: SYS_gettid takes no arguments and always succeeds.
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u64
}

/// Portable fallback: a process-local id assigned on first use. Behaves like
/// a tid for registry purposes (stable per thread, may be recycled).
#[cfg(not(target_os = "linux"))]
pub(crate) fn current_tid() -> u64 {
    use std::sync::atomic::AtomicU64;
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|t| *t)
}

pub(crate) struct ThreadSlot {
    tid: u64,
    pub(crate) buffer: EventBuffer,
}

thread_local! {
    /// `(engine key, resolved slot)` for the most recent engine this thread
    /// emitted through. A null slot with a matching key records an allocation
    /// failure so the thread does not re-probe the table on every emit.
    static RESOLVED: Cell<(usize, *const ThreadSlot)> =
        const { Cell::new((0, std::ptr::null())) };
}

pub(crate) struct Registry {
    slots: Box<[AtomicPtr<ThreadSlot>]>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        let slots = (0..REGISTRY_SLOTS)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        Self { slots }
    }

    /// Resolve the calling thread's buffer, allocating on first touch.
    ///
    /// `engine_key` is the owning engine's process-unique id; it keys the
    /// thread-local cache so a thread interleaving several engines never sees
    /// a stale slot. `register` runs once, when a fresh slot wins its table
    /// position.
    #[inline]
    pub(crate) fn resolve(
        &self,
        engine_key: usize,
        capacity: usize,
        register: impl FnMut(&EventBuffer),
    ) -> Option<&EventBuffer> {
        let (key, cached) = RESOLVED.with(Cell::get);
        if key == engine_key {
            // SAFETY: a cached non-null slot points into this registry's
            // table, which frees nothing while the engine is alive.
            return unsafe { cached.as_ref() }.map(|slot| &slot.buffer);
        }
        self.resolve_slow(engine_key, capacity, register)
    }

    #[cold]
    fn resolve_slow(
        &self,
        engine_key: usize,
        capacity: usize,
        register: impl FnMut(&EventBuffer),
    ) -> Option<&EventBuffer> {
        let resolved = self.lookup(current_tid(), capacity, register);
        let cached = resolved.map_or(std::ptr::null(), |slot| slot as *const ThreadSlot);
        RESOLVED.with(|c| c.set((engine_key, cached)));
        resolved.map(|slot| &slot.buffer)
    }

    /// Table walk for `tid`: direct-mapped entry first, then linear probing.
    ///
    /// Visible to tests so collision handling can be exercised with crafted
    /// ids; production callers go through [`Registry::resolve`].
    pub(crate) fn lookup(
        &self,
        tid: u64,
        capacity: usize,
        mut register: impl FnMut(&EventBuffer),
    ) -> Option<&ThreadSlot> {
        let mask = REGISTRY_SLOTS - 1;
        let mut index = tid as usize & mask;
        let mut probes = 0;
        while probes < REGISTRY_SLOTS {
            let slot = &self.slots[index];
            let existing = slot.load(Ordering::Acquire);
            if existing.is_null() {
                let buffer = match EventBuffer::new(tid, capacity) {
                    Some(buffer) => buffer,
                    None => {
                        eprintln!(
                            "lop: event buffer allocation failed for thread {tid:#x}; \
                             this thread will not record"
                        );
                        return None;
                    }
                };
                let fresh = Box::into_raw(Box::new(ThreadSlot { tid, buffer }));
                match slot.compare_exchange(
                    std::ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // SAFETY: `fresh` was just installed and the table
                        // owns it until Registry::drop.
                        let installed = unsafe { &*fresh };
                        register(&installed.buffer);
                        return Some(installed);
                    }
                    Err(_) => {
                        // Another thread claimed the slot between the load
                        // and the CAS; free ours and re-examine the index.
                        // SAFETY: `fresh` never escaped.
                        drop(unsafe { Box::from_raw(fresh) });
                        continue;
                    }
                }
            }
            // SAFETY: non-null slots point at table-owned ThreadSlots.
            let occupant = unsafe { &*existing };
            if occupant.tid == tid {
                return Some(occupant);
            }
            index = (index + 1) & mask;
            probes += 1;
        }
        eprintln!("lop: thread registry full; thread {tid:#x} will not record");
        None
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        for slot in &self.slots {
            let p = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                // SAFETY: the table exclusively owns installed slots, and
                // Engine::drop guarantees no thread is still emitting.
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}
