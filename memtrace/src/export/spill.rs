//! Sorted runs of events parked on disk until the artifact is written

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};

use crate::domain::ExportError;
use crate::events::TraceEvent;

pub(crate) type EventSource<'a> = Box<dyn Iterator<Item = Result<TraceEvent, ExportError>> + 'a>;

/// One timestamp-sorted batch, one JSON document per line in an unlinked
/// temporary file
#[derive(Debug)]
pub(crate) struct SpillRun {
    file: File,
}

impl SpillRun {
    /// `events` must already be sorted
    pub(crate) fn write(events: &[TraceEvent]) -> Result<Self, ExportError> {
        let mut writer = BufWriter::new(tempfile::tempfile()?);
        for event in events {
            serde_json::to_writer(&mut writer, event)?;
            writer.write_all(b"\n")?;
        }
        let mut file = writer.into_inner().map_err(|e| ExportError::Io(e.into_error()))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Self { file })
    }

    pub(crate) fn into_source<'a>(self) -> EventSource<'a> {
        Box::new(BufReader::new(self.file).lines().map(
            |line| -> Result<TraceEvent, ExportError> { Ok(serde_json::from_str(&line?)?) },
        ))
    }
}

/// K-way merge of sorted sources on `timestamp_ns`
///
/// Ties go to the lower source index, so feeding sources in push order keeps
/// the merge stable.
pub(crate) fn merge_sorted<F>(mut sources: Vec<EventSource<'_>>, mut sink: F) -> Result<u64, ExportError>
where
    F: FnMut(&TraceEvent) -> Result<(), ExportError>,
{
    let mut heads: Vec<Option<TraceEvent>> = Vec::with_capacity(sources.len());
    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (index, source) in sources.iter_mut().enumerate() {
        let head = source.next().transpose()?;
        if let Some(event) = &head {
            heap.push(Reverse((event.timestamp_ns, index)));
        }
        heads.push(head);
    }

    let mut written = 0;
    while let Some(Reverse((_, index))) = heap.pop() {
        let Some(event) = heads[index].take() else {
            continue;
        };
        sink(&event)?;
        written += 1;

        if let Some(next) = sources[index].next().transpose()? {
            heap.push(Reverse((next.timestamp_ns, index)));
            heads[index] = Some(next);
        }
    }
    Ok(written)
}
