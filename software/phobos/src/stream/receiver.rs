//! Streaming receiver: one worker thread per active stream, pre-allocated
//! packet slots, loss tolerated as holes.
//!
//! Each worker owns its socket and its stream's slot vector. Packets are
//! indexed by the sequence counter in their header; a counter that is not
//! strictly greater than the last one seen, or that lands beyond the
//! pre-allocated slots, marks the whole stream failed — the device promises
//! in-order delivery per stream, so a regression is a protocol violation
//! rather than reordering to tolerate. Counters that never arrive simply
//! leave their slot empty.
//!
//! The orchestrating loop evaluates a caller-supplied progress callback once
//! per iteration; returning `false` is the cancellation mechanism and stops
//! all workers promptly, releasing their sockets.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use phobos_shared::header::{HeaderV1, HeaderV2, HEADER_LEN};
use phobos_shared::registers::FirmwareGeneration;
use phobos_shared::STREAM_PORTS;

use crate::error::{DeviceError, Result};

use super::StreamPlan;

/// Socket poll tick; workers notice the stop flag at this cadence
const POLL_TICK: Duration = Duration::from_millis(50);

/// Receive buffer size, covering a full ethernet frame
const STREAM_BUFFER_LEN: usize = 1522;

/// One stream's receive state: the pre-allocated packet slots plus the
/// ordering bookkeeping
#[derive(Debug)]
pub struct StreamState {
    /// Received datagrams (header + payload), indexed by packet counter.
    /// A `None` is a packet that never arrived.
    slots: Vec<Option<Vec<u8>>>,
    last_counter: Option<u64>,
    received: usize,
    failed: Option<String>,
    done: bool,
}

impl StreamState {
    fn new(expected_packets: usize) -> Self {
        Self {
            slots: vec![None; expected_packets],
            last_counter: None,
            received: 0,
            failed: None,
            done: false,
        }
    }

    /// Account one datagram. Ordering violations mark the stream failed;
    /// the highest expected counter marks it done.
    fn ingest(&mut self, datagram: Vec<u8>, generation: FirmwareGeneration) {
        if self.failed.is_some() || self.done {
            return;
        }
        let counter = match packet_counter(&datagram, generation) {
            Some(counter) => counter,
            None => {
                warn!("ignoring runt stream datagram of {} bytes", datagram.len());
                return;
            }
        };

        if let Some(last) = self.last_counter {
            if counter <= last {
                self.failed = Some(format!(
                    "packet counter regressed from {last} to {counter}"
                ));
                return;
            }
        }
        if counter >= self.slots.len() as u64 {
            self.failed = Some(format!(
                "packet counter {counter} beyond the {} expected packets",
                self.slots.len()
            ));
            return;
        }

        let index = counter as usize;
        self.slots[index] = Some(datagram);
        self.last_counter = Some(counter);
        self.received += 1;
        if index == self.slots.len() - 1 {
            self.done = true;
        }
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn expected(&self) -> usize {
        self.slots.len()
    }

    /// Why the stream failed, if it did
    pub fn failure(&self) -> Option<&str> {
        self.failed.as_deref()
    }

    /// The received datagrams, indexed by packet counter
    pub fn slots(&self) -> &[Option<Vec<u8>>] {
        &self.slots
    }
}

fn packet_counter(datagram: &[u8], generation: FirmwareGeneration) -> Option<u64> {
    match generation {
        FirmwareGeneration::Gen1 => HeaderV1::new(datagram).map(|h| h.packet_counter()),
        FirmwareGeneration::Gen2 => HeaderV2::new(datagram).map(|h| h.packet_counter()),
    }
}

/// Snapshot handed to the progress callback once per orchestration tick
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveProgress {
    pub packets_received: usize,
    pub packets_expected: usize,
    pub streams_finished: usize,
    pub streams_failed: usize,
}

enum WorkerEvent {
    Progress { board: usize, received: usize },
    Finished { board: usize, state: StreamState },
}

/// Receiver for one measurement: configure with a plan, bind, receive,
/// then extract channels. States: configured -> bound -> received.
pub struct StreamReceiver {
    plan: StreamPlan,
    generation: FirmwareGeneration,
    stream_timeout: Duration,
    /// Bound sockets per board, present between bind() and receive()
    sockets: Vec<Option<UdpSocket>>,
    /// Final stream states per board, present after receive()
    streams: Vec<Option<StreamState>>,
}

impl StreamReceiver {
    pub fn new(plan: StreamPlan, generation: FirmwareGeneration, stream_timeout: Duration) -> Self {
        let n = plan.boards.len();
        Self {
            plan,
            generation,
            stream_timeout,
            sockets: (0..n).map(|_| None).collect(),
            streams: (0..n).map(|_| None).collect(),
        }
    }

    pub fn plan(&self) -> &StreamPlan {
        &self.plan
    }

    /// Bind one socket per active board at the well-known stream ports
    pub fn bind(&mut self) -> Result<()> {
        self.bind_ports(&STREAM_PORTS)
    }

    /// Bind one socket per active board; a port of 0 picks an ephemeral
    /// port, which tests discover through [`Self::local_ports`]
    pub fn bind_ports(&mut self, ports: &[u16; 4]) -> Result<()> {
        for (i, board) in self.plan.boards.iter().enumerate() {
            if board.expected_packets == 0 {
                continue;
            }
            let port = ports[board.stream_index];
            let socket = UdpSocket::bind(("0.0.0.0", port)).map_err(|e| {
                DeviceError::link(format!("unable to bind stream {} port {port}", board.stream_index), e)
            })?;
            socket
                .set_read_timeout(Some(POLL_TICK))
                .map_err(|e| DeviceError::link("unable to set stream socket timeout", e))?;
            self.sockets[i] = Some(socket);
        }
        Ok(())
    }

    /// Actual local port per board, `None` for inactive boards
    pub fn local_ports(&self) -> Vec<Option<u16>> {
        self.sockets
            .iter()
            .map(|s| {
                s.as_ref()
                    .and_then(|s| s.local_addr().ok())
                    .map(|a| a.port())
            })
            .collect()
    }

    /// Run the receive loop until every active stream finishes (or fails,
    /// or goes quiet for the stream timeout), or until `progress` returns
    /// `false`.
    ///
    /// Packet loss does not fail a stream or the measurement; missing
    /// packets stay as holes for extraction to stop at.
    pub fn receive(&mut self, mut progress: impl FnMut(&ReceiveProgress) -> bool) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx): (Sender<WorkerEvent>, Receiver<WorkerEvent>) = unbounded();

        let mut active = 0usize;
        let mut expected_total = 0usize;
        let mut handles = Vec::new();
        for (i, board) in self.plan.boards.iter().enumerate() {
            let Some(socket) = self.sockets[i].take() else {
                continue;
            };
            if board.expected_packets == 0 {
                continue;
            }
            active += 1;
            expected_total += board.expected_packets;

            let worker = StreamWorker {
                board: i,
                socket,
                state: StreamState::new(board.expected_packets),
                generation: self.generation,
                stream_timeout: self.stream_timeout,
                stop: stop.clone(),
                event_tx: event_tx.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("stream-rx-{i}"))
                .spawn(move || worker.run())
                .map_err(|e| DeviceError::link("unable to spawn stream worker", e))?;
            handles.push(handle);
        }
        drop(event_tx);

        if active == 0 {
            return Err(DeviceError::config(
                "no active streams; bind() not called or all boards disabled",
            ));
        }

        // Orchestration loop: account worker events, evaluate the
        // cancellation predicate once per iteration
        let mut received_per_board = vec![0usize; self.plan.boards.len()];
        let mut finished = 0usize;
        while finished < active {
            match event_rx.recv_timeout(POLL_TICK) {
                Ok(WorkerEvent::Progress { board, received }) => {
                    received_per_board[board] = received;
                }
                Ok(WorkerEvent::Finished { board, state }) => {
                    received_per_board[board] = state.received();
                    self.streams[board] = Some(state);
                    finished += 1;
                }
                Err(_) => {} // tick with no events; fall through to the callback
            }

            let snapshot = ReceiveProgress {
                packets_received: received_per_board.iter().sum(),
                packets_expected: expected_total,
                streams_finished: self
                    .streams
                    .iter()
                    .filter(|s| s.as_ref().is_some_and(|s| s.failure().is_none()))
                    .count(),
                streams_failed: self
                    .streams
                    .iter()
                    .filter(|s| s.as_ref().is_some_and(|s| s.failure().is_some()))
                    .count(),
            };
            if !progress(&snapshot) && !stop.load(Ordering::Relaxed) {
                debug!("stream receive cancelled by caller");
                stop.store(true, Ordering::Relaxed);
            }
        }

        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }

    /// One stream's final state, once received
    pub fn stream(&self, board: usize) -> Option<&StreamState> {
        self.streams.get(board).and_then(|s| s.as_ref())
    }

    /// Reconstruct one channel's sample sequence from a received stream.
    /// The sequence is truncated at the first hole that interrupts a
    /// sample; missing data is never fabricated.
    pub fn get_channel_data(&self, board: usize, channel: usize) -> Result<Vec<u32>> {
        let plan = self.plan.boards.get(board).ok_or_else(|| {
            DeviceError::config(format!("no board {board} in the stream plan"))
        })?;
        let state = self.stream(board).ok_or_else(|| {
            DeviceError::config(format!("board {board} has no received stream"))
        })?;
        super::channel::extract(plan, state.slots(), self.generation, channel)
    }
}

/// Worker that drains one stream's socket into its slot vector
struct StreamWorker {
    board: usize,
    socket: UdpSocket,
    state: StreamState,
    generation: FirmwareGeneration,
    stream_timeout: Duration,
    stop: Arc<AtomicBool>,
    event_tx: Sender<WorkerEvent>,
}

impl StreamWorker {
    fn run(mut self) {
        let mut buf = vec![0u8; STREAM_BUFFER_LEN];
        let mut last_activity = Instant::now();

        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            if self.state.done || self.state.failed.is_some() {
                break;
            }
            if last_activity.elapsed() > self.stream_timeout {
                debug!(
                    "stream {} quiet for {:?} with {}/{} packets; giving up",
                    self.board,
                    self.stream_timeout,
                    self.state.received(),
                    self.state.expected()
                );
                break;
            }

            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    last_activity = Instant::now();
                    self.state.ingest(buf[..n].to_vec(), self.generation);
                    let _ = self.event_tx.send(WorkerEvent::Progress {
                        board: self.board,
                        received: self.state.received(),
                    });
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => {
                    self.state.failed = Some(format!("stream socket error: {e}"));
                    break;
                }
            }
        }

        if let Some(reason) = self.state.failure() {
            warn!("stream {} failed: {reason}", self.board);
        }
        let board = self.board;
        let _ = self.event_tx.send(WorkerEvent::Finished {
            board,
            state: self.state,
        });
        // Socket dropped here, releasing the port
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stream::{BoardStreamSetup, StreamPlan};

    /// Datagram with a Gen2 header carrying `counter`, padded with payload
    fn datagram(counter: u64, payload: &[u8]) -> Vec<u8> {
        let mut d = vec![0u8; HEADER_LEN];
        d[8..14].copy_from_slice(&counter.to_be_bytes()[2..8]);
        d.extend_from_slice(payload);
        d
    }

    #[test]
    fn test_ingest_monotonicity_violation_fails_the_stream() {
        let mut state = StreamState::new(10);
        for counter in [0u64, 1, 2] {
            state.ingest(datagram(counter, &[0; 8]), FirmwareGeneration::Gen2);
            assert!(state.failure().is_none());
        }

        // A repeated counter is a protocol violation
        state.ingest(datagram(2, &[0; 8]), FirmwareGeneration::Gen2);
        assert!(state.failure().unwrap().contains("regressed"));

        // The stream never advances past the violation
        state.ingest(datagram(4, &[0; 8]), FirmwareGeneration::Gen2);
        assert_eq!(state.received(), 3);
        assert!(state.slots()[4].is_none());
    }

    #[test]
    fn test_ingest_tolerates_holes() {
        let mut state = StreamState::new(5);
        for counter in [0u64, 1, 4] {
            state.ingest(datagram(counter, &[0; 8]), FirmwareGeneration::Gen2);
        }
        assert!(state.failure().is_none());
        // Receiving the highest expected counter stops the stream
        assert!(state.done);
        assert_eq!(state.received(), 3);
        assert!(state.slots()[2].is_none());
        assert!(state.slots()[3].is_none());
    }

    #[test]
    fn test_ingest_rejects_counter_beyond_slots() {
        let mut state = StreamState::new(3);
        state.ingest(datagram(3, &[0; 8]), FirmwareGeneration::Gen2);
        assert!(state.failure().unwrap().contains("beyond"));
    }

    #[test]
    fn test_receive_end_to_end_over_loopback() {
        // 4 bytes/sample (one 14-bit channel), 8 samples, 8-byte packets
        // => 4 expected packets
        let plan = StreamPlan::plan(
            &[BoardStreamSetup {
                stream_index: 0,
                chip_masks: [0x01, 0, 0, 0],
                resolution_bits: 14,
            }],
            8,
            58,
        )
        .unwrap();
        assert_eq!(plan.boards[0].expected_packets, 4);

        let mut receiver =
            StreamReceiver::new(plan, FirmwareGeneration::Gen2, Duration::from_secs(2));
        receiver.bind_ports(&[0, 0, 0, 0]).unwrap();
        let port = receiver.local_ports()[0].unwrap();

        let sender = std::thread::spawn(move || {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            // Packet 2 is lost; the highest counter still arrives
            for counter in [0u64, 1, 3] {
                let d = datagram(counter, &[counter as u8; 8]);
                socket.send_to(&d, ("127.0.0.1", port)).unwrap();
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let mut ticks = 0usize;
        receiver
            .receive(|_| {
                ticks += 1;
                true
            })
            .unwrap();
        sender.join().unwrap();

        assert!(ticks > 0);
        let state = receiver.stream(0).unwrap();
        assert!(state.failure().is_none());
        assert_eq!(state.received(), 3);
        assert!(state.slots()[2].is_none());
        assert_eq!(state.slots()[3].as_ref().unwrap()[HEADER_LEN], 3);
    }

    #[test]
    fn test_receive_cancellation_stops_promptly() {
        let plan = StreamPlan::plan(
            &[BoardStreamSetup {
                stream_index: 0,
                chip_masks: [0x01, 0, 0, 0],
                resolution_bits: 14,
            }],
            1_000_000,
            1500,
        )
        .unwrap();

        let mut receiver =
            StreamReceiver::new(plan, FirmwareGeneration::Gen2, Duration::from_secs(60));
        receiver.bind_ports(&[0, 0, 0, 0]).unwrap();

        let started = Instant::now();
        // No packets will ever arrive; cancel on the third tick
        let mut ticks = 0usize;
        receiver
            .receive(|_| {
                ticks += 1;
                ticks < 3
            })
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
