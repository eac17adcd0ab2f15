//! Ring buffer draining
//!
//! Items are consumed in commit order and decoded immediately. A record that
//! cannot be decoded is logged and skipped; draining never stops on bad data.

use aya::maps::{MapData, RingBuf};
use log::warn;
use std::io;
use tokio::io::unix::AsyncFd;

use crate::domain::TracerError;
use crate::events::{decode_alloc, decode_process, TraceEvent};
use crate::export::ArtifactCollector;

pub type Decoder = fn(&[u8]) -> Result<TraceEvent, TracerError>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub decoded: u64,
    pub rejected: u64,
}

impl DrainStats {
    fn record(&mut self, result: Result<TraceEvent, TracerError>, collector: &mut ArtifactCollector) {
        match result {
            Ok(event) => {
                self.decoded += 1;
                collector.push(event);
            }
            Err(e) => {
                self.rejected += 1;
                warn!("Dropping record: {e}");
            }
        }
    }
}

/// Decode a batch of raw items into `collector`
pub fn drain_ring<I>(items: I, decode: Decoder, collector: &mut ArtifactCollector) -> DrainStats
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut stats = DrainStats::default();
    for item in items {
        stats.record(decode(item.as_ref()), collector);
    }
    stats
}

/// One kernel ring buffer and how to decode it
///
/// The ring is registered with the tokio reactor, so the session wakes up as
/// soon as the kernel commits a record instead of on a timer.
pub struct RingDrain {
    ring: AsyncFd<RingBuf<MapData>>,
    decode: Decoder,
    stats: DrainStats,
}

impl RingDrain {
    /// # Errors
    /// Returns an error if the ring cannot be registered with the reactor
    pub fn process(ring: RingBuf<MapData>) -> io::Result<Self> {
        Ok(Self { ring: AsyncFd::new(ring)?, decode: decode_process, stats: DrainStats::default() })
    }

    /// # Errors
    /// Returns an error if the ring cannot be registered with the reactor
    pub fn alloc(ring: RingBuf<MapData>) -> io::Result<Self> {
        Ok(Self { ring: AsyncFd::new(ring)?, decode: decode_alloc, stats: DrainStats::default() })
    }

    /// Wait until the kernel signals new records
    ///
    /// Readiness is cleared before returning, so the caller must drain
    /// afterwards; records committed after that raise readiness again.
    /// Cancel safe.
    ///
    /// # Errors
    /// Returns an error if polling the ring fails
    pub async fn ready(&mut self) -> io::Result<()> {
        let mut guard = self.ring.readable_mut().await?;
        guard.clear_ready();
        Ok(())
    }

    /// Consume everything currently committed, returns the number of items read
    pub fn drain_into(&mut self, collector: &mut ArtifactCollector) -> u64 {
        let before = self.stats;
        let ring = self.ring.get_mut();
        while let Some(item) = ring.next() {
            let bytes: &[u8] = &item;
            self.stats.record((self.decode)(bytes), collector);
        }
        (self.stats.decoded - before.decoded) + (self.stats.rejected - before.rejected)
    }

    #[must_use]
    pub fn stats(&self) -> DrainStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Pid;
    use memtrace_common::{AllocKind, AllocRecord};

    fn record_bytes(kind: AllocKind, ts: u64) -> Vec<u8> {
        let record = AllocRecord::new(kind, ts, 1, 1);
        #[allow(unsafe_code)]
        let bytes = unsafe {
            std::slice::from_raw_parts(
                std::ptr::addr_of!(record).cast::<u8>(),
                std::mem::size_of::<AllocRecord>(),
            )
        };
        bytes.to_vec()
    }

    #[test]
    fn test_bad_records_skipped() {
        let mut collector = ArtifactCollector::new(Pid(1));
        let mut unknown = record_bytes(AllocKind::Free { addr: 8 }, 2);
        unknown[0] = 77;

        let items = vec![
            record_bytes(AllocKind::Malloc { addr: 8, size: 16 }, 1),
            vec![0u8; 10],
            unknown,
            record_bytes(AllocKind::Free { addr: 8 }, 3),
        ];
        let stats = drain_ring(items, decode_alloc, &mut collector);

        assert_eq!(stats, DrainStats { decoded: 2, rejected: 2 });
        assert_eq!(collector.len(), 2);
    }
}
