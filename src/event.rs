/// Tag identifying what a recorded event describes.
///
/// Discriminants are stable; the formatter maps them to Chrome Trace Event
/// phases (`B`, `E`, `C`, `s`, `f`).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CallBegin = 0,
    CallEnd = 1,
    CallBeginMeta = 2,
    CallEndMeta = 3,
    CounterInt = 4,
    FlowStart = 5,
    FlowFinish = 6,
}

/// Fixed-size event record appended to a per-thread buffer.
///
/// Appending one record is a handful of aligned stores; the timestamp is
/// always written last, from a single hardware counter read per emission.
///
/// Thread identity is deliberately absent: it is an attribute of the buffer a
/// record lives in, which the formatter patches back in at flush time.
///
/// `name` is a `&'static str` on purpose. The engine never copies name bytes,
/// so the storage has to outlive the next flush; requiring a `'static`
/// reference makes that contract a compile-time fact instead of a footgun.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub timestamp: u64,
    pub name: &'static str,
    pub metadata: u64,
    pub kind: EventKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_discriminants_are_stable() {
        assert_eq!(EventKind::CallBegin as u32, 0);
        assert_eq!(EventKind::CallEnd as u32, 1);
        assert_eq!(EventKind::CallBeginMeta as u32, 2);
        assert_eq!(EventKind::CallEndMeta as u32, 3);
        assert_eq!(EventKind::CounterInt as u32, 4);
        assert_eq!(EventKind::FlowStart as u32, 5);
        assert_eq!(EventKind::FlowFinish as u32, 6);
    }

    #[test]
    fn record_is_a_few_words() {
        // One record must stay small enough that an emission is a handful of
        // stores: timestamp + fat name pointer + metadata + tag.
        assert!(std::mem::size_of::<Event>() <= 40);
        assert_eq!(std::mem::align_of::<Event>(), 8);
    }
}
