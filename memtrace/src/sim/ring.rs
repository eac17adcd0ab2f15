//! Bounded event channel standing in for a BPF ring buffer

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use memtrace_common::EventSink;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-record header the kernel ring buffer prepends
const RECORD_HEADER_BYTES: usize = 8;

/// Records a ring buffer of `bytes` can hold at once
#[must_use]
pub const fn slots_for<T>(bytes: usize) -> usize {
    let record = (std::mem::size_of::<T>() + 7) & !7;
    bytes / (record + RECORD_HEADER_BYTES)
}

/// MPSC queue with reserve-or-drop semantics
///
/// Producers never block: when the queue is full the record is counted as
/// dropped and discarded.
#[derive(Debug)]
pub struct EventRing<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    dropped: AtomicU64,
}

impl<T> EventRing<T> {
    /// Ring sized like a kernel ring buffer of `bytes`
    #[must_use]
    pub fn with_byte_size(bytes: usize) -> Self {
        Self::with_slots(slots_for::<T>(bytes))
    }

    #[must_use]
    pub fn with_slots(slots: usize) -> Self {
        let (tx, rx) = bounded(slots);
        Self { tx, rx, dropped: AtomicU64::new(0) }
    }

    /// Everything committed so far, in commit order
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Copy> EventSink<T> for EventRing<T> {
    fn submit(&self, record: &T) -> bool {
        match self.tx.try_send(*record) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memtrace_common::{AllocRecord, ProcessRecord, RING_BUF_BYTES};

    #[test]
    fn test_slots_for_kernel_buffer() {
        // 48-byte records + 8-byte header
        assert_eq!(slots_for::<AllocRecord>(RING_BUF_BYTES as usize), 4681);
        assert_eq!(slots_for::<ProcessRecord>(RING_BUF_BYTES as usize), 4681);
        assert_eq!(slots_for::<u8>(64), 4);
    }

    #[test]
    fn test_full_ring_drops() {
        let ring = EventRing::<u32>::with_slots(2);
        assert!(ring.submit(&1));
        assert!(ring.submit(&2));
        assert!(!ring.submit(&3));
        assert_eq!(ring.dropped(), 1);
        assert_eq!(ring.drain(), vec![1, 2]);
        assert!(ring.submit(&4));
    }
}
