//! The data-plane streaming worker.
//!
//! One [`StreamWorker`] runs per measurement, on a blocking thread under
//! `tokio::task::spawn_blocking`. It owns the TCP connection, feeds the
//! framing engines, and applies decoded payloads to the shared buffer
//! under the mode's policy. The socket polls with a short read timeout so
//! the stop flag is observed within milliseconds; nothing in the loop
//! blocks indefinitely and no error escapes the worker, since a live
//! measurement must not be lost to one malformed packet.

use crate::framing::{EventChunker, Record, RecordAssembler};
use parking_lot::RwLock;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tpx3_core::buffer::DataBuffer;
use tpx3_core::config::DetectorConfig;
use tpx3_core::error::{CoreResult, Tpx3Error};
use tpx3_core::limits::{CONNECT_TIMEOUT, RECV_CHUNK_BYTES, SOCKET_POLL_TIMEOUT};
use tpx3_core::mode::{ApplyPolicy, FramingRegime};
use tpx3_core::scan::ScanCollaborator;

/// Open the data-plane connection and perform the handshake.
///
/// The serialized configuration goes out once, immediately after
/// connect, before the server begins streaming.
pub(crate) fn connect_data_plane(
    host: &str,
    port: u16,
    config: &DetectorConfig,
) -> CoreResult<TcpStream> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|err| Tpx3Error::Transport(format!("resolve {host}:{port}: {err}")))?
        .next()
        .ok_or_else(|| Tpx3Error::Transport(format!("no address for {host}:{port}")))?;
    let mut socket = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|err| Tpx3Error::Transport(format!("connect {host}:{port}: {err}")))?;
    socket.set_nodelay(true)?;
    socket.set_read_timeout(Some(SOCKET_POLL_TIMEOUT))?;
    socket.write_all(&config.serialize()?)?;
    tracing::info!(host, port, "data plane connected");
    Ok(socket)
}

/// Whether a read error is the poll-timeout tick rather than a failure.
fn is_poll_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Blocking reader filling the acquisition buffer for one session.
pub(crate) struct StreamWorker {
    socket: TcpStream,
    config: DetectorConfig,
    buffer: Arc<RwLock<DataBuffer>>,
    stop: Arc<AtomicBool>,
    progress: Arc<AtomicU64>,
    data_ready: watch::Sender<u64>,
    scan: Option<Arc<dyn ScanCollaborator>>,
    sequence_target: Option<u64>,
}

impl StreamWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        socket: TcpStream,
        config: DetectorConfig,
        buffer: Arc<RwLock<DataBuffer>>,
        stop: Arc<AtomicBool>,
        progress: Arc<AtomicU64>,
        data_ready: watch::Sender<u64>,
        scan: Option<Arc<dyn ScanCollaborator>>,
        sequence_target: Option<u64>,
    ) -> Self {
        Self {
            socket,
            config,
            buffer,
            stop,
            progress,
            data_ready,
            scan,
            sequence_target,
        }
    }

    /// Run the session to completion. Never panics, never returns early
    /// with an error: all failure paths log and end the loop.
    pub(crate) fn run(mut self) {
        match self.config.mode.regime() {
            FramingRegime::HeaderFramed => self.run_header_framed(),
            FramingRegime::RawEvents => self.run_events(),
        }
        let frames = self.progress.load(Ordering::SeqCst);
        tracing::info!(mode = ?self.config.mode, frames, "stream session ended");
    }

    fn run_header_framed(&mut self) {
        let policy = self.config.mode.policy();
        let total_elements = self.buffer.read().element_count();
        let mut assembler = RecordAssembler::new();
        let mut chunk = vec![0u8; RECV_CHUNK_BYTES];

        'session: while !self.stop.load(Ordering::Relaxed) {
            match self.socket.read(&mut chunk) {
                Ok(0) => {
                    tracing::info!("remote closed the data stream");
                    break;
                }
                Ok(received) => {
                    assembler.push(&chunk[..received]);
                    loop {
                        match assembler.next_record() {
                            Ok(Some(record)) => {
                                if self.apply_record(policy, &record, total_elements) {
                                    tracing::info!(
                                        frame = record.header.frame_number,
                                        "windowed acquisition reached its target"
                                    );
                                    break 'session;
                                }
                            }
                            Ok(None) => break,
                            Err(err) if err.is_stream_recoverable() => tracing::warn!(
                                mode = ?self.config.mode,
                                discarded = assembler.discarded_bytes(),
                                %err,
                                "dropping malformed record"
                            ),
                            Err(err) => {
                                tracing::error!(%err, "unrecoverable stream error");
                                break 'session;
                            }
                        }
                    }
                }
                Err(err) if is_poll_timeout(&err) => continue,
                Err(err) => {
                    tracing::warn!(%err, "data stream ended");
                    break;
                }
            }
        }
    }

    /// Apply one record under `policy`. Returns true when a windowed
    /// session has reached its configured element count.
    fn apply_record(&self, policy: ApplyPolicy, record: &Record, total_elements: usize) -> bool {
        let Record { header, payload } = record;
        match policy {
            ApplyPolicy::Replace => {
                if let Err(err) = self.buffer.write().fill_from(payload) {
                    tracing::warn!(
                        frame = header.frame_number,
                        bytes = payload.len(),
                        %err,
                        "frame dropped"
                    );
                    return false;
                }
                self.publish(1);
                false
            }
            ApplyPolicy::WindowedAccumulate => {
                let elem_width = self.buffer.read().element_type().width();
                let record_len = payload.len() / elem_width;
                let offset = header.frame_number as usize * record_len;
                if let Err(err) = self.buffer.write().write_at(offset, payload) {
                    tracing::warn!(
                        frame = header.frame_number,
                        offset,
                        bytes = payload.len(),
                        %err,
                        "window dropped"
                    );
                    return false;
                }
                self.publish(1);
                offset + record_len >= total_elements
            }
            // Histogram modes never reach the header-framed loop; the
            // regime table keys off the policy.
            ApplyPolicy::Histogram => false,
        }
    }

    fn run_events(&mut self) {
        let elem = match self.config.element_type() {
            Ok(elem) => elem,
            Err(err) => {
                tracing::error!(%err, "event stream cannot start");
                return;
            }
        };
        let mut chunker = EventChunker::new(elem);
        let mut chunk = vec![0u8; RECV_CHUNK_BYTES];
        let mut addresses: Vec<u64> = Vec::with_capacity(RECV_CHUNK_BYTES / elem.width());

        while !self.stop.load(Ordering::Relaxed) {
            if self.scan_finished() {
                break;
            }
            match self.socket.read(&mut chunk) {
                Ok(0) => {
                    tracing::info!("remote closed the event stream");
                    break;
                }
                Ok(received) => {
                    addresses.clear();
                    chunker.push(&chunk[..received], &mut addresses);
                    if addresses.is_empty() {
                        continue;
                    }
                    let applied = self.buffer.write().increment(&addresses);
                    if applied < addresses.len() {
                        tracing::debug!(
                            dropped = addresses.len() - applied,
                            "events addressed outside the buffer"
                        );
                    }
                    self.publish(applied as u64);
                }
                Err(err) if is_poll_timeout(&err) => continue,
                Err(err) => {
                    tracing::warn!(%err, "event stream ended");
                    break;
                }
            }
        }

        // Lock-step shutdown: never leave the scan generator running
        // after the event stream ends.
        if let Some(scan) = &self.scan {
            if let Ok(true) = scan.is_playing() {
                if let Err(err) = scan.stop() {
                    tracing::warn!(%err, "failed to stop scan generator");
                }
            }
        }
    }

    /// Data-plane termination is never signalled on the wire for event
    /// modes; the scan collaborator decides instead.
    fn scan_finished(&self) -> bool {
        let Some(scan) = &self.scan else {
            return false;
        };
        match scan.is_playing() {
            Ok(false) => {
                tracing::info!("scan generator stopped; ending event stream");
                return true;
            }
            Err(err) => {
                tracing::warn!(%err, "scan generator unreachable");
                return false;
            }
            Ok(true) => {}
        }
        if let Some(target) = self.sequence_target {
            match scan.filled_sequence_count() {
                Ok(filled) if filled >= target => {
                    tracing::info!(filled, target, "sequence buffer target reached");
                    return true;
                }
                Err(err) => tracing::warn!(%err, "sequence count unreadable"),
                Ok(_) => {}
            }
        }
        false
    }

    fn publish(&self, units: u64) {
        let count = self.progress.fetch_add(units, Ordering::SeqCst) + units;
        let _ = self.data_ready.send(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;
    use tpx3_core::mode::AcquisitionMode;
    use tpx3_core::scan::MockScan;

    fn frame_record(frame_number: u64, payload: &[u8]) -> Vec<u8> {
        let mut wire = format!(
            "{{\"timeAtFrame\":0.0,\"frameNumber\":{frame_number},\"measurementID\":null,\
             \"dataSize\":{},\"bitDepth\":8,\"width\":{},\"height\":1}}\n",
            payload.len(),
            payload.len()
        )
        .into_bytes();
        wire.extend_from_slice(payload);
        wire
    }

    struct Harness {
        buffer: Arc<RwLock<DataBuffer>>,
        stop: Arc<AtomicBool>,
        progress: Arc<AtomicU64>,
        worker: StreamWorker,
        server: TcpStream,
    }

    fn harness(config: DetectorConfig, scan: Option<Arc<dyn ScanCollaborator>>, target: Option<u64>) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = connect_data_plane("127.0.0.1", addr.port(), &config).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        // Drain the handshake line the worker sent on connect.
        let mut handshake = vec![0u8; 4096];
        let n = server.read(&mut handshake).unwrap();
        assert_eq!(handshake[n - 1], b'\n');

        let buffer = Arc::new(RwLock::new(DataBuffer::allocate(&config).unwrap()));
        let stop = Arc::new(AtomicBool::new(false));
        let progress = Arc::new(AtomicU64::new(0));
        let (tx, _rx) = watch::channel(0);
        let worker = StreamWorker::new(
            client,
            config,
            buffer.clone(),
            stop.clone(),
            progress.clone(),
            tx,
            scan,
            target,
        );
        Harness {
            buffer,
            stop,
            progress,
            worker,
            server,
        }
    }

    #[test]
    fn replace_policy_keeps_last_frame_and_counts() {
        let config = DetectorConfig {
            width: 4,
            height: 1,
            byte_width: 1,
            soft_binning: false,
            ..DetectorConfig::default()
        };
        let mut h = harness(config, None, None);

        for (n, payload) in [(1u64, [1u8, 1, 1, 1]), (2, [2, 2, 2, 2]), (3, [9, 8, 7, 6])] {
            h.server.write_all(&frame_record(n, &payload)).unwrap();
        }
        drop(h.server); // graceful close ends the session

        h.worker.run();
        assert_eq!(h.progress.load(Ordering::SeqCst), 3);
        assert_eq!(h.buffer.read().as_bytes(), &[9, 8, 7, 6]);
    }

    #[test]
    fn size_mismatch_drops_frame_and_session_continues() {
        let config = DetectorConfig {
            width: 4,
            height: 1,
            byte_width: 1,
            ..DetectorConfig::default()
        };
        let mut h = harness(config, None, None);

        // Geometry says 4 bytes but the header declares 6.
        let mut bad = b"{\"timeAtFrame\":0.0,\"frameNumber\":1,\"measurementID\":null,\
             \"dataSize\":6,\"bitDepth\":8,\"width\":4,\"height\":1}\n"
            .to_vec();
        bad.extend_from_slice(&[0xEE; 4]);
        h.server.write_all(&bad).unwrap();
        h.server.write_all(&frame_record(2, &[5, 5, 5, 5])).unwrap();
        drop(h.server);

        h.worker.run();
        assert_eq!(h.progress.load(Ordering::SeqCst), 1);
        assert_eq!(h.buffer.read().as_bytes(), &[5, 5, 5, 5]);
    }

    #[test]
    fn windowed_accumulate_places_out_of_order_frames_and_completes() {
        let config = DetectorConfig {
            mode: AcquisitionMode::EventHyperspec,
            spim_width: 2,
            spim_height: 2,
            width: 4,
            byte_width: 1,
            ..DetectorConfig::default()
        };
        let mut h = harness(config, None, None);

        // Four spectra of four bytes each; the first two arrive swapped.
        for (n, payload) in [
            (1u64, [11u8, 11, 11, 11]),
            (0, [10, 10, 10, 10]),
            (2, [12, 12, 12, 12]),
            (3, [13, 13, 13, 13]),
        ] {
            h.server.write_all(&frame_record(n, &payload)).unwrap();
        }
        // No close: completion must come from the offset range.

        h.worker.run();
        assert_eq!(h.progress.load(Ordering::SeqCst), 4);
        let expected: Vec<u8> = [10u8, 11, 12, 13]
            .iter()
            .flat_map(|&v| [v; 4])
            .collect();
        assert_eq!(h.buffer.read().as_bytes(), &expected[..]);
    }

    #[test]
    fn event_stream_histograms_and_follows_scan_termination() {
        let config = DetectorConfig {
            mode: AcquisitionMode::EventListScan,
            scan_width: 4,
            scan_height: 2,
            byte_width: 4,
            ..DetectorConfig::default()
        };
        let scan = Arc::new(MockScan::default());
        scan.set_sequence_target(8).unwrap();
        scan.start().unwrap();
        let mut h = harness(config, Some(scan.clone()), Some(8));

        let worker = h.worker;
        let handle = std::thread::spawn(move || worker.run());

        // 3.5 events in the first chunk; the half word must wait.
        let words: Vec<u8> = [0u32, 3, 3, 7]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        h.server.write_all(&words[..14]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        h.server.write_all(&words[14..]).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while h.progress.load(Ordering::SeqCst) < 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(h.progress.load(Ordering::SeqCst), 4);

        // Scan reaches its pixel target; the loop must exit on its own
        // and stop the generator.
        scan.fill(8);
        handle.join().unwrap();

        let buffer = h.buffer.read();
        assert_eq!(buffer.cell(0), Some(1));
        assert_eq!(buffer.cell(3), Some(2));
        assert_eq!(buffer.cell(7), Some(1));
        assert!(!scan.is_playing().unwrap());
    }

    #[test]
    fn stop_flag_ends_session_promptly() {
        let config = DetectorConfig {
            width: 4,
            height: 1,
            byte_width: 1,
            ..DetectorConfig::default()
        };
        let h = harness(config, None, None);
        h.stop.store(true, Ordering::SeqCst);

        let started = std::time::Instant::now();
        h.worker.run();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
