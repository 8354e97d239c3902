//! Userspace reader for `SYSCALL_EVENTS`
//!
//! One task per online CPU drains that CPU's perf ring, decodes each
//! sample into an [`EventRecord`] and hands it to the [`EventProducer`].
//! Records the ring overwrote before we got to them (`lost`) and records
//! the channel refused are both counted as drops.

use std::mem::size_of;

use heimdall_common::EventRecord;

/// Decode one perf sample.
///
/// Returns `None` for samples shorter than an `EventRecord`; perf pads
/// samples to 8 bytes, so longer ones are expected.
pub fn decode_record(sample: &[u8]) -> Option<EventRecord> {
    if sample.len() < size_of::<EventRecord>() {
        return None;
    }
    // SAFETY: length checked above; EventRecord is repr(C) plain data and
    // every bit pattern is valid for it
    Some(unsafe { std::ptr::read_unaligned(sample.as_ptr() as *const EventRecord) })
}

/// Abort reader tasks started so far.
#[cfg_attr(not(feature = "ebpf"), allow(dead_code))]
pub(crate) fn abort_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        handle.abort();
    }
}

#[cfg(feature = "ebpf")]
pub(crate) use reader::spawn_readers;

#[cfg(feature = "ebpf")]
mod reader {
    use aya::maps::perf::AsyncPerfEventArrayBuffer;
    use aya::maps::{AsyncPerfEventArray, MapData};
    use aya::util::online_cpus;
    use bytes::BytesMut;
    use tokio::task::JoinHandle;

    use super::{abort_all, decode_record};
    use crate::ebpf::EbpfError;
    use crate::enforcement::{EventProducer, Publish};
    use crate::metrics;

    /// Ring size per CPU, in pages
    const PAGES_PER_CPU: usize = 64;

    /// Samples read per wakeup
    const BATCH: usize = 16;

    /// Spawn one reader per online CPU.
    ///
    /// All or nothing: if any CPU's buffer fails to open, the readers
    /// already spawned are aborted before the error is returned.
    pub(crate) fn spawn_readers(
        mut events: AsyncPerfEventArray<MapData>,
        producer: &EventProducer,
    ) -> Result<Vec<JoinHandle<()>>, EbpfError> {
        let cpus = online_cpus()
            .map_err(|e| EbpfError::Map(format!("failed to list online CPUs: {:?}", e)))?;

        let mut handles = Vec::with_capacity(cpus.len());
        for cpu_id in cpus {
            let buf = match events.open(cpu_id, Some(PAGES_PER_CPU)) {
                Ok(buf) => buf,
                Err(e) => {
                    abort_all(handles);
                    return Err(EbpfError::Map(format!(
                        "failed to open perf buffer on CPU {}: {}",
                        cpu_id, e
                    )));
                }
            };
            handles.push(tokio::spawn(read_cpu(cpu_id, buf, producer.clone())));
        }

        tracing::debug!(cpus = handles.len(), "event readers started");
        Ok(handles)
    }

    async fn read_cpu(
        cpu_id: u32,
        mut buf: AsyncPerfEventArrayBuffer<MapData>,
        producer: EventProducer,
    ) {
        let mut buffers = (0..BATCH)
            .map(|_| BytesMut::with_capacity(std::mem::size_of::<heimdall_common::EventRecord>()))
            .collect::<Vec<_>>();

        loop {
            let events = match buf.read_events(&mut buffers).await {
                Ok(events) => events,
                Err(e) => {
                    tracing::error!(cpu = cpu_id, error = %e, "perf buffer read failed");
                    return;
                }
            };

            if events.lost > 0 {
                let lost = events.lost as u64;
                producer.note_dropped(lost);
                metrics::record_dropped(lost);
                tracing::debug!(cpu = cpu_id, lost, "perf ring overflowed");
            }

            for sample in buffers.iter().take(events.read) {
                let Some(record) = decode_record(sample) else {
                    tracing::debug!(cpu = cpu_id, len = sample.len(), "short perf sample");
                    producer.note_dropped(1);
                    metrics::record_dropped(1);
                    continue;
                };
                match producer.publish(&record) {
                    Publish::Sent => {}
                    Publish::Saturated => metrics::record_dropped(1),
                    Publish::Detached => {
                        tracing::debug!(cpu = cpu_id, "consumer gone, reader exiting");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heimdall_common::comm_from_bytes;

    fn as_bytes(record: &EventRecord) -> Vec<u8> {
        let ptr = record as *const EventRecord as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, size_of::<EventRecord>()) }.to_vec()
    }

    #[test]
    fn test_decode_record() {
        let mut record = EventRecord::zeroed();
        record.fill(77, 1000, 165, 500, comm_from_bytes(b"mounter"));

        let decoded = decode_record(&as_bytes(&record)).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_padded_sample() {
        let mut record = EventRecord::zeroed();
        record.fill(1, 2, 3, 4, comm_from_bytes(b"x"));
        let mut bytes = as_bytes(&record);
        bytes.extend_from_slice(&[0u8; 4]);

        assert_eq!(decode_record(&bytes).unwrap().pid, 1);
    }

    #[test]
    fn test_decode_unaligned() {
        let mut record = EventRecord::zeroed();
        record.fill(9, 0, 62, 42, comm_from_bytes(b"k"));
        let mut bytes = vec![0u8];
        bytes.extend(as_bytes(&record));

        assert_eq!(decode_record(&bytes[1..]).unwrap().cgroup_id, 42);
    }

    #[test]
    fn test_short_sample_rejected() {
        let bytes = vec![0u8; size_of::<EventRecord>() - 1];
        assert!(decode_record(&bytes).is_none());
        assert!(decode_record(&[]).is_none());
    }

    #[tokio::test]
    async fn test_abort_all_stops_spawned_readers() {
        let (producer, mut consumer) = crate::enforcement::event_channel(4);
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let producer = producer.clone();
                tokio::spawn(async move {
                    let _producer = producer;
                    std::future::pending::<()>().await
                })
            })
            .collect();
        drop(producer);

        abort_all(handles);

        // Aborted readers release their producers, which closes the channel
        let closed =
            tokio::time::timeout(std::time::Duration::from_secs(2), consumer.recv()).await;
        assert!(matches!(closed, Ok(None)));
    }
}
