//! Per-thread append-only event buffer.
//!
//! Each writer thread owns exactly one buffer (single-producer). The write
//! cursor is an absolute pointer to the next free slot: reservation and
//! region identity are fused in that one atomic, so a recovery hot-swap can
//! never interleave between a cursor bump and a separate base-pointer read.
//! Reservation is a plain load/store by default and a compare-exchange bump
//! under `safer-lossless`, where the recovery path swaps regions underneath
//! live writers.

use crate::event::Event;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Extra slots allocated past the advertised capacity.
///
/// Defense for the emit path's check-then-reserve window around a hot-swap:
/// a bounds check made against one region may precede a reservation granted
/// from the other, and the slack keeps any straggling stores inside the
/// allocation on whichever region they land.
pub(crate) const STRAGGLER_SLACK: usize = 64;

fn region_layout(capacity: usize) -> Layout {
    Layout::array::<Event>(capacity + STRAGGLER_SLACK).expect("buffer capacity overflows a Layout")
}

/// Allocate an uninitialized record region. Null on allocation failure --
/// the caller degrades to not tracing rather than aborting.
fn alloc_region(capacity: usize) -> *mut Event {
    // SAFETY: the layout is non-zero-sized (Event is not a ZST and
    // capacity + STRAGGLER_SLACK >= 1).
    unsafe { alloc::alloc(region_layout(capacity)) as *mut Event }
}

/// # Safety
/// `ptr` must have come from `alloc_region(capacity)` and not been freed.
unsafe fn free_region(ptr: *mut Event, capacity: usize) {
    // SAFETY: same layout as the matching alloc_region call.
    unsafe { alloc::dealloc(ptr as *mut u8, region_layout(capacity)) }
}

/// Record count between a region base and a cursor, via address arithmetic.
///
/// Works on raw addresses rather than `offset_from` because a torn read pair
/// (base from one region, cursor from the other, mid-swap) must yield a
/// harmless out-of-range number, not undefined behavior; callers clamp or
/// reject the result.
fn records_between(base: *mut Event, next: *mut Event) -> usize {
    (next as usize).wrapping_sub(base as usize) / std::mem::size_of::<Event>()
}

/// An event region detached from its buffer by a recovery hot-swap, handed to
/// a background writer which formats it and then frees it on drop.
#[cfg(feature = "safer")]
pub(crate) struct Region {
    ptr: *mut Event,
    len: usize,
    capacity: usize,
}

// SAFETY: the region is exclusively owned once detached; the records are
// plain `Copy` data.
#[cfg(feature = "safer")]
unsafe impl Send for Region {}

#[cfg(feature = "safer")]
impl Region {
    pub(crate) fn events(&self) -> &[Event] {
        // SAFETY: the first `len` slots were written by the owning thread
        // before the swap detached the region; any reservation still in
        // flight at swap time finishes its stores long before the scheduler
        // hands the region to a writer.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

#[cfg(feature = "safer")]
impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: `ptr` was produced by alloc_region(self.capacity) and the
        // region has exclusive ownership of it.
        unsafe { free_region(self.ptr, self.capacity) }
    }
}

pub(crate) struct EventBuffer {
    /// Base of the live region.
    events: AtomicPtr<Event>,
    /// Absolute write cursor: the next free slot. Mutated only by the owning
    /// thread, except for the substitution during a hot-swap or the rewind
    /// after a flush. Because the cursor carries the region identity, a
    /// lossless reservation that races a swap either lands wholly in the old
    /// region (and is counted in its detached length) or retries wholly into
    /// the new one; it can never mix an old offset with a new base.
    next_event: AtomicPtr<Event>,
    capacity: usize,
    thread_id: u64,
    /// Pre-allocated replacement region so the hot-swap never allocates on
    /// the critical path. Consumed by the swap, replenished by the scheduler.
    #[cfg(feature = "safer")]
    standby: AtomicPtr<Event>,
}

impl EventBuffer {
    /// Allocate a buffer for `thread_id`. `None` when the allocation failed;
    /// the thread then simply records nothing.
    pub(crate) fn new(thread_id: u64, capacity: usize) -> Option<Self> {
        let events = alloc_region(capacity);
        if events.is_null() {
            return None;
        }
        #[cfg(feature = "safer")]
        let standby = {
            let standby = alloc_region(capacity);
            if standby.is_null() {
                // SAFETY: `events` was just allocated with this capacity.
                unsafe { free_region(events, capacity) };
                return None;
            }
            standby
        };
        Some(Self {
            events: AtomicPtr::new(events),
            next_event: AtomicPtr::new(events),
            capacity,
            thread_id,
            #[cfg(feature = "safer")]
            standby: AtomicPtr::new(standby),
        })
    }

    pub(crate) fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub(crate) fn len(&self) -> usize {
        let base = self.events.load(Ordering::Acquire);
        let next = self.next_event.load(Ordering::Acquire);
        records_between(base, next).min(self.capacity)
    }

    /// Whether `n` more records fit within the advertised capacity.
    #[inline]
    pub(crate) fn has_room(&self, n: usize) -> bool {
        let base = self.events.load(Ordering::Relaxed);
        let next = self.next_event.load(Ordering::Relaxed);
        records_between(base, next).saturating_add(n) <= self.capacity
    }

    /// Reserve `n` consecutive slots and return the first.
    ///
    /// The caller must have checked [`EventBuffer::has_room`]; only the
    /// owning thread reserves. The returned write address and the cursor
    /// bump come from one atomic operation on `next_event`.
    #[inline]
    pub(crate) fn reserve(&self, n: usize) -> *mut Event {
        #[cfg(feature = "safer-lossless")]
        {
            let mut p = self.next_event.load(Ordering::Relaxed);
            loop {
                // SAFETY: `p` is the live region's cursor with at least `n`
                // advertised slots free (the region extends STRAGGLER_SLACK
                // slots past the advertised capacity besides).
                let bumped = unsafe { p.add(n) };
                match self.next_event.compare_exchange_weak(
                    p,
                    bumped,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return p,
                    // A hot-swap substituted the region between the load and
                    // the exchange; the retry reserves from the fresh one.
                    Err(current) => p = current,
                }
            }
        }
        #[cfg(not(feature = "safer-lossless"))]
        {
            let p = self.next_event.load(Ordering::Relaxed);
            // Plain bump: the recovery swap only runs with writers quiesced.
            // SAFETY: in bounds per the caller's check plus the slack.
            self.next_event.store(unsafe { p.add(n) }, Ordering::Relaxed);
            p
        }
    }

    /// Copy the written records out. Runs while writers are quiescent
    /// (flush holds the control lock and the engine is disabled).
    pub(crate) fn copy_events(&self) -> Vec<Event> {
        let base = self.events.load(Ordering::Acquire);
        let len = self.len();
        // SAFETY: the first `len` slots were fully written by the owning
        // thread before it observed the engine disabled.
        unsafe { std::slice::from_raw_parts(base, len).to_vec() }
    }

    /// Rewind the cursor to the region base. Only called while writers are
    /// quiesced, after a flush snapshot has copied the records out.
    pub(crate) fn reset(&self) {
        self.next_event
            .store(self.events.load(Ordering::Acquire), Ordering::Release);
    }

    /// Swap the standby region in and detach the full one.
    ///
    /// Returns `None` when no standby is available (the scheduler has not
    /// replenished since the last swap); the buffer then keeps its current
    /// region untouched. Runs under the exhaustion + control + buffers locks.
    #[cfg(feature = "safer")]
    pub(crate) fn swap_in_standby(&self) -> Option<Region> {
        let standby = self.standby.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if standby.is_null() {
            return None;
        }
        let old_base = self.events.load(Ordering::Acquire);
        // Substituting the cursor first closes the reservation window: from
        // this point a lossless writer's compare-exchange against the old
        // region fails and retries into the standby, and every reservation
        // granted before this line is counted in `old_next`.
        let old_next = self.next_event.swap(standby, Ordering::AcqRel);
        self.events.store(standby, Ordering::Release);
        let len = records_between(old_base, old_next).min(self.capacity);
        Some(Region {
            ptr: old_base,
            len,
            capacity: self.capacity,
        })
    }

    #[cfg(feature = "safer")]
    pub(crate) fn has_standby(&self) -> bool {
        !self.standby.load(Ordering::Acquire).is_null()
    }

    /// Allocate a fresh standby region if the slot is empty. Called from the
    /// scheduler thread, never from the emit path.
    #[cfg(feature = "safer")]
    pub(crate) fn replenish_standby(&self) {
        if self.has_standby() {
            return;
        }
        let fresh = alloc_region(self.capacity);
        if fresh.is_null() {
            eprintln!(
                "lop: standby allocation failed for thread {:#x}; next exhaustion will drop events",
                self.thread_id
            );
            return;
        }
        let prev = self.standby.swap(fresh, Ordering::AcqRel);
        if !prev.is_null() {
            // Raced another replenish; keep the newer region.
            // SAFETY: `prev` came from alloc_region with this capacity and
            // is no longer reachable.
            unsafe { free_region(prev, self.capacity) };
        }
    }
}

impl Drop for EventBuffer {
    fn drop(&mut self) {
        let events = self.events.load(Ordering::Acquire);
        if !events.is_null() {
            // SAFETY: the live region always comes from alloc_region with
            // this buffer's capacity.
            unsafe { free_region(events, self.capacity) };
        }
        #[cfg(feature = "safer")]
        {
            let standby = self.standby.load(Ordering::Acquire);
            if !standby.is_null() {
                // SAFETY: as above.
                unsafe { free_region(standby, self.capacity) };
            }
        }
    }
}

/// Shared pointer to a registry-owned buffer.
///
/// The registry never frees a slot while its engine is alive, so these stay
/// valid for as long as anything can hold one (the engine's live list and
/// in-flight recovery work, both torn down before the registry in
/// `Engine::drop`).
#[derive(Clone)]
pub(crate) struct BufferRef(NonNull<EventBuffer>);

// SAFETY: EventBuffer is all atomics + immutable fields (Sync), and the
// pointee outlives every holder per the type-level comment above.
unsafe impl Send for BufferRef {}
unsafe impl Sync for BufferRef {}

impl BufferRef {
    pub(crate) fn new(buffer: &EventBuffer) -> Self {
        Self(NonNull::from(buffer))
    }

    pub(crate) fn get(&self) -> &EventBuffer {
        // SAFETY: see the Send/Sync justification.
        unsafe { self.0.as_ref() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn write_one(buf: &EventBuffer, name: &'static str, ts: u64) {
        let p = buf.reserve(1);
        // SAFETY: reserve handed out an in-bounds slot owned by this thread.
        unsafe {
            (*p).name = name;
            (*p).metadata = 0;
            (*p).kind = EventKind::CallBegin;
            (*p).timestamp = ts;
        }
    }

    #[test]
    fn append_and_copy_preserve_order() {
        let buf = EventBuffer::new(7, 16).unwrap();
        for i in 0..5 {
            write_one(&buf, "x", i);
        }
        let events = buf.copy_events();
        assert_eq!(events.len(), 5);
        for (i, e) in events.iter().enumerate() {
            assert_eq!(e.timestamp, i as u64);
        }
    }

    #[test]
    fn has_room_tracks_capacity() {
        let buf = EventBuffer::new(1, 4).unwrap();
        assert!(buf.has_room(4));
        for _ in 0..4 {
            write_one(&buf, "x", 0);
        }
        assert!(!buf.has_room(1));
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn reset_rewinds_the_cursor() {
        let buf = EventBuffer::new(1, 8).unwrap();
        write_one(&buf, "x", 1);
        buf.reset();
        assert_eq!(buf.len(), 0);
        assert!(buf.has_room(8));
    }

    #[cfg(feature = "safer")]
    #[test]
    fn swap_detaches_the_full_region() {
        let buf = EventBuffer::new(3, 4).unwrap();
        for i in 0..4 {
            write_one(&buf, "x", i);
        }
        assert!(buf.has_standby());

        let region = buf.swap_in_standby().expect("standby was pre-allocated");
        assert_eq!(region.events().len(), 4);
        assert_eq!(region.events()[2].timestamp, 2);

        // Fresh region, empty cursor, standby consumed.
        assert_eq!(buf.len(), 0);
        assert!(!buf.has_standby());
        assert!(buf.swap_in_standby().is_none());

        buf.replenish_standby();
        assert!(buf.has_standby());
    }

    #[cfg(feature = "safer")]
    #[test]
    fn reservations_after_a_swap_land_in_the_fresh_region() {
        let buf = EventBuffer::new(9, 4).unwrap();
        for i in 0..4 {
            write_one(&buf, "old", i);
        }
        let region = buf.swap_in_standby().unwrap();
        assert_eq!(region.events().len(), 4);

        // The next reservation starts at the standby's base.
        write_one(&buf, "new", 99);
        assert_eq!(buf.len(), 1);
        let events = buf.copy_events();
        assert_eq!(events[0].name, "new");
        assert_eq!(events[0].timestamp, 99);
        // The detached region is unaffected by post-swap writes.
        assert_eq!(region.events()[3].timestamp, 3);
    }

    #[cfg(feature = "safer")]
    #[test]
    fn partial_buffer_swap_keeps_only_written_records() {
        // The hot-swap substitutes every live buffer, including ones that
        // are nowhere near full; the detached length must cover exactly the
        // written prefix.
        let buf = EventBuffer::new(5, 64).unwrap();
        for i in 0..3 {
            write_one(&buf, "partial", i);
        }
        let region = buf.swap_in_standby().unwrap();
        assert_eq!(region.events().len(), 3);
        assert_eq!(region.events()[2].timestamp, 2);
        assert_eq!(buf.len(), 0);
    }
}
