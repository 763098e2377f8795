//! The ping engine: sends one echo request at a time, waits for the matching
//! reply and reports every attempt.
//!
//! A [`Pinger`] is started once with [`Pinger::ping`]. While it runs, results
//! flow out through the [`Report`] channels and a [`StopHandle`] may end the
//! run at the next attempt boundary or during the pause between probes.

use rand::Rng;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep};

use crate::clock::{Clock, SystemClock};
use crate::icmp::{
    IcmpError, IcmpSocket, TIMESTAMP_LEN, Transport, decode_echo_reply, encode_echo_request,
    extract_timestamp,
};
use crate::stats::PingStatistics;
use crate::utils::generate_identifier;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_PACKET_SIZE: usize = 56;
/// Largest echo payload that fits in an IPv4 datagram.
pub const MAX_PACKET_SIZE: usize = 65507;
pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// How long to wait for each reply.
    pub timeout: Duration,
    /// Number of attempts; 0 runs until stopped.
    pub count: u32,
    /// Payload bytes per request.
    pub packet_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            count: 0,
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

impl Options {
    /// Replaces zero timeout and zero packet size with their defaults.
    pub fn normalized(mut self) -> Self {
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.packet_size == 0 {
            self.packet_size = DEFAULT_PACKET_SIZE;
        }
        self
    }
}

/// Result of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub sequence: u64,
    /// Bytes of the accepted reply, 0 on timeout.
    pub size: usize,
    pub rtt: Duration,
    pub timeout: bool,
}

impl Outcome {
    pub fn success(sequence: u64, size: usize, rtt: Duration) -> Self {
        Self {
            sequence,
            size,
            rtt,
            timeout: false,
        }
    }

    pub fn timeout(sequence: u64) -> Self {
        Self {
            sequence,
            size: 0,
            rtt: Duration::ZERO,
            timeout: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingerState {
    Idle,
    Running,
    Stopped,
    Failed,
}

#[derive(Debug, Error)]
pub enum PingError {
    #[error("packet size {0} must be between 8 and 65507 bytes")]
    InvalidPacketSize(usize),
    #[error("pinger has already been started")]
    AlreadyStarted,
    #[error("cannot open ICMP socket: {0}")]
    TransportOpen(#[source] io::Error),
    #[error("cannot send ping packet for icmp_seq {sequence}: {source}")]
    Send { sequence: u64, source: io::Error },
    #[error("cannot read packet for icmp_seq {sequence}: {source}")]
    Receive { sequence: u64, source: io::Error },
    #[error("cannot encode packet: {0}")]
    Encode(#[from] IcmpError),
}

/// Receiving ends handed to whoever renders the run.
#[derive(Debug)]
pub struct Report {
    /// One outcome per attempt, in sequence order. Closes when the run ends.
    pub outcomes: mpsc::UnboundedReceiver<Outcome>,
    /// Fires at most once, with the error that failed the run.
    pub error: oneshot::Receiver<PingError>,
}

/// Requests a running [`Pinger`] to stop. Repeated calls are harmless.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

pub struct Pinger<C = SystemClock> {
    options: Options,
    identifier: u16,
    clock: C,
    state: PingerState,
    stats: PingStatistics,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    outcome_tx: Option<mpsc::UnboundedSender<Outcome>>,
    error_tx: Option<oneshot::Sender<PingError>>,
    report: Option<Report>,
}

impl Pinger<SystemClock> {
    pub fn new(options: Options) -> Result<Self, PingError> {
        Self::with_clock(options, SystemClock, &mut rand::thread_rng())
    }
}

impl<C: Clock> Pinger<C> {
    /// Builds a pinger whose identifier is drawn once from `rng`.
    pub fn with_clock<R: Rng + ?Sized>(
        options: Options,
        clock: C,
        rng: &mut R,
    ) -> Result<Self, PingError> {
        let options = options.normalized();
        if !(TIMESTAMP_LEN..=MAX_PACKET_SIZE).contains(&options.packet_size) {
            return Err(PingError::InvalidPacketSize(options.packet_size));
        }

        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let (error_tx, error) = oneshot::channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            options,
            identifier: generate_identifier(rng),
            clock,
            state: PingerState::Idle,
            stats: PingStatistics::new(),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            outcome_tx: Some(outcome_tx),
            error_tx: Some(error_tx),
            report: Some(Report { outcomes, error }),
        })
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn state(&self) -> PingerState {
        self.state
    }

    /// Takes the report channels. Returns `None` after the first call.
    ///
    /// Take them before starting the run: a run started without anyone
    /// holding the report discards its outcomes and error instead of
    /// buffering them.
    pub fn report(&mut self) -> Option<Report> {
        self.report.take()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop_tx))
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Snapshot of the statistics. Only complete once the run has ended.
    pub fn stats(&self) -> PingStatistics {
        self.stats.clone()
    }

    /// Pings `target` over a raw ICMP socket until the count is reached, a
    /// stop is requested or the socket fails.
    pub async fn ping(&mut self, target: Ipv4Addr) -> Result<PingerState, PingError> {
        self.ping_with(target, IcmpSocket::open).await
    }

    /// Like [`Pinger::ping`], over the transport returned by `open`. Fatal
    /// errors go to the report's error slot; the returned error only covers
    /// starting twice.
    pub async fn ping_with<T, F>(
        &mut self,
        target: Ipv4Addr,
        open: F,
    ) -> Result<PingerState, PingError>
    where
        T: Transport,
        F: FnOnce() -> io::Result<T>,
    {
        if self.state != PingerState::Idle {
            return Err(PingError::AlreadyStarted);
        }
        self.state = PingerState::Running;

        // Unclaimed channels would buffer every outcome of an unbounded run
        self.report = None;
        let outcomes = self.outcome_tx.take();
        let errors = self.error_tx.take();

        log::info!(
            "pinging {} (id={}, size={}, timeout={:?}, count={})",
            target,
            self.identifier,
            self.options.packet_size,
            self.options.timeout,
            self.options.count
        );

        let result = match open() {
            Ok(mut transport) => self.drive(&mut transport, target, outcomes.as_ref()).await,
            Err(e) => Err(PingError::TransportOpen(e)),
        };

        self.state = match result {
            Ok(()) => PingerState::Stopped,
            Err(e) => {
                log::debug!("ping run failed: {}", e);
                if let Some(Err(e)) = errors.map(|tx| tx.send(e)) {
                    log::warn!("nobody is listening for the ping error: {}", e);
                }
                PingerState::Failed
            }
        };
        log::info!(
            "ping run ended as {:?} after {} attempts",
            self.state,
            self.stats.transmitted()
        );

        // Closing the outcome stream is the last thing the run does
        drop(outcomes);
        Ok(self.state)
    }

    async fn drive<T: Transport>(
        &mut self,
        transport: &mut T,
        target: Ipv4Addr,
        outcomes: Option<&mpsc::UnboundedSender<Outcome>>,
    ) -> Result<(), PingError> {
        let mut stop = self.stop_rx.clone();
        let mut sequence: u64 = 0;

        loop {
            if *stop.borrow() {
                return Ok(());
            }

            let outcome = self.attempt(transport, target, sequence).await?;
            if outcome.timeout {
                self.stats.record_timeout();
            } else {
                self.stats.record_success(outcome.rtt);
            }
            if let Some(tx) = outcomes {
                let _ = tx.send(outcome);
            }

            sequence += 1;
            if self.options.count != 0 && sequence == u64::from(self.options.count) {
                return Ok(());
            }

            tokio::select! {
                _ = sleep(PROBE_INTERVAL) => {}
                _ = stop_requested(&mut stop) => return Ok(()),
            }
        }
    }

    /// One send and the wait for its reply. Replies that fail to decode or
    /// belong to another request are dropped and the wait goes on.
    async fn attempt<T: Transport>(
        &mut self,
        transport: &mut T,
        target: Ipv4Addr,
        sequence: u64,
    ) -> Result<Outcome, PingError> {
        // The wire carries the low 16 bits of the sequence
        let wire_sequence = sequence as u16;
        let request = encode_echo_request(
            self.identifier,
            wire_sequence,
            self.options.packet_size,
            self.clock.now(),
        )?;

        transport
            .send_to(&request, target)
            .map_err(|source| PingError::Send { sequence, source })?;
        let deadline = Instant::now() + self.options.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Outcome::timeout(sequence));
            }

            let reply = match transport.recv(remaining).await {
                Ok(Some(reply)) => reply,
                Ok(None) => return Ok(Outcome::timeout(sequence)),
                Err(source) => return Err(PingError::Receive { sequence, source }),
            };

            match decode_echo_reply(self.identifier, wire_sequence, &reply)
                .and_then(|payload| extract_timestamp(&payload))
            {
                Ok(sent_at) => {
                    let rtt = self.clock.now().duration_since(sent_at).unwrap_or_default();
                    return Ok(Outcome::success(sequence, reply.len(), rtt));
                }
                Err(e) => log::debug!("discarding reply for icmp_seq {}: {}", sequence, e),
            }
        }
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *stop.borrow_and_update();
        if stopped || stop.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::icmp::packet::echo_reply_for;
    use crate::icmp::{ICMP_HEADER_LEN, IcmpPacket};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::UNIX_EPOCH;
    use tokio::sync::oneshot::error::TryRecvError;

    const TARGET: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const REPLY_LEN: usize = ICMP_HEADER_LEN + DEFAULT_PACKET_SIZE;

    /// What the fake network does on each receive call.
    enum Step {
        Echo(Duration),
        Silence,
        Stray,
        Garbage,
        Fail,
    }

    struct FakeTransport {
        clock: FakeClock,
        script: VecDeque<Step>,
        last_request: Option<Vec<u8>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        fail_send: bool,
    }

    impl FakeTransport {
        fn new(clock: &FakeClock, script: impl IntoIterator<Item = Step>) -> Self {
            Self {
                clock: clock.clone(),
                script: script.into_iter().collect(),
                last_request: None,
                sent: Arc::new(Mutex::new(Vec::new())),
                fail_send: false,
            }
        }
    }

    impl Transport for FakeTransport {
        fn send_to(&mut self, packet: &[u8], target: Ipv4Addr) -> io::Result<()> {
            assert_eq!(target, TARGET);
            if self.fail_send {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "send refused"));
            }
            self.sent.lock().unwrap().push(packet.to_vec());
            self.last_request = Some(packet.to_vec());
            Ok(())
        }

        async fn recv(&mut self, _wait: Duration) -> io::Result<Option<Vec<u8>>> {
            let request = self.last_request.clone().expect("recv before send");
            match self.script.pop_front().unwrap_or(Step::Silence) {
                Step::Echo(delay) => {
                    self.clock.advance(delay);
                    Ok(Some(echo_reply_for(&request)))
                }
                Step::Silence => Ok(None),
                Step::Stray => {
                    let mut packet = IcmpPacket::from_bytes(&echo_reply_for(&request)).unwrap();
                    packet.identifier = packet.identifier.wrapping_add(1);
                    packet.calculate_checksum();
                    Ok(Some(packet.to_bytes()))
                }
                Step::Garbage => Ok(Some(vec![0xde, 0xad])),
                Step::Fail => Err(io::Error::new(io::ErrorKind::ConnectionReset, "socket gone")),
            }
        }
    }

    fn echo(millis: u64) -> Step {
        Step::Echo(Duration::from_millis(millis))
    }

    fn fake_clock() -> FakeClock {
        FakeClock::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }

    fn pinger(clock: &FakeClock, count: u32) -> Pinger<FakeClock> {
        let options = Options {
            count,
            ..Options::default()
        };
        Pinger::with_clock(options, clock.clone(), &mut StdRng::seed_from_u64(42)).unwrap()
    }

    fn drain(report: &mut Report) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while let Ok(outcome) = report.outcomes.try_recv() {
            outcomes.push(outcome);
        }
        outcomes
    }

    #[test]
    fn test_options_defaults() {
        let options = Options {
            timeout: Duration::ZERO,
            count: 5,
            packet_size: 0,
        }
        .normalized();

        assert_eq!(options.timeout, DEFAULT_TIMEOUT);
        assert_eq!(options.count, 5);
        assert_eq!(options.packet_size, DEFAULT_PACKET_SIZE);
    }

    #[test]
    fn test_invalid_packet_size_rejected() {
        let clock = fake_clock();
        for size in [4, MAX_PACKET_SIZE + 1] {
            let options = Options {
                packet_size: size,
                ..Options::default()
            };
            let result = Pinger::with_clock(options, clock.clone(), &mut StdRng::seed_from_u64(1));
            assert!(matches!(result, Err(PingError::InvalidPacketSize(s)) if s == size));
        }
    }

    #[test]
    fn test_identifier_comes_from_injected_rng() {
        let clock = fake_clock();
        let expected = generate_identifier(&mut StdRng::seed_from_u64(42));
        let pinger = pinger(&clock, 1);
        assert_eq!(pinger.identifier(), expected);
        assert_eq!(pinger.state(), PingerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_limits_attempts() {
        let clock = fake_clock();
        let mut pinger = pinger(&clock, 3);
        let mut report = pinger.report().unwrap();
        let transport = FakeTransport::new(&clock, [echo(10), echo(20), echo(30)]);
        let sent = Arc::clone(&transport.sent);

        let state = pinger.ping_with(TARGET, move || Ok(transport)).await.unwrap();
        assert_eq!(state, PingerState::Stopped);

        let outcomes = drain(&mut report);
        let sequences: Vec<u64> = outcomes.iter().map(|o| o.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(outcomes.iter().all(|o| !o.timeout && o.size == REPLY_LEN));
        assert_eq!(outcomes[1].rtt, Duration::from_millis(20));

        assert_eq!(sent.lock().unwrap().len(), 3);
        assert!(report.outcomes.recv().await.is_none());
        assert!(matches!(report.error.try_recv(), Err(TryRecvError::Closed)));

        let stats = pinger.stats();
        assert_eq!(stats.transmitted(), 3);
        assert_eq!(stats.received(), 3);
        assert_eq!(stats.packet_loss(), 0.0);
        let rtt = stats.rtt_summary();
        assert_eq!((rtt.min, rtt.avg, rtt.max), (10.0, 20.0, 30.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_recorded_and_run_continues() {
        let clock = fake_clock();
        let mut pinger = pinger(&clock, 3);
        let mut report = pinger.report().unwrap();
        let transport = FakeTransport::new(&clock, [echo(5), Step::Silence, echo(15)]);

        pinger.ping_with(TARGET, move || Ok(transport)).await.unwrap();

        let outcomes = drain(&mut report);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[1], Outcome::timeout(1));
        assert!(!outcomes[2].timeout);

        let stats = pinger.stats();
        assert_eq!(stats.transmitted(), outcomes.len() as u64);
        assert_eq!(stats.transmitted(), stats.received() + stats.timeouts());
        assert_eq!(stats.rtts().len() as u64, stats.received());
        assert!((stats.packet_loss() - 100.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_replies_are_ignored_while_waiting() {
        let clock = fake_clock();
        let mut pinger = pinger(&clock, 2);
        let mut report = pinger.report().unwrap();
        let transport = FakeTransport::new(
            &clock,
            [
                // attempt 0: stray reply then the real one
                Step::Stray,
                Step::Garbage,
                echo(7),
                // attempt 1: only a stray reply before the wait expires
                Step::Stray,
                Step::Silence,
            ],
        );

        pinger.ping_with(TARGET, move || Ok(transport)).await.unwrap();

        let outcomes = drain(&mut report);
        assert_eq!(outcomes[0], Outcome::success(0, REPLY_LEN, Duration::from_millis(7)));
        assert_eq!(outcomes[1], Outcome::timeout(1));
        assert_eq!(pinger.stats().received(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start_makes_no_attempts() {
        let clock = fake_clock();
        let mut pinger = pinger(&clock, 0);
        let mut report = pinger.report().unwrap();
        let transport = FakeTransport::new(&clock, []);
        let sent = Arc::clone(&transport.sent);

        pinger.stop_handle().stop();
        pinger.stop();
        let state = pinger.ping_with(TARGET, move || Ok(transport)).await.unwrap();

        assert_eq!(state, PingerState::Stopped);
        assert!(sent.lock().unwrap().is_empty());
        assert!(report.outcomes.recv().await.is_none());
        assert!(matches!(report.error.try_recv(), Err(TryRecvError::Closed)));
        assert_eq!(pinger.stats(), PingStatistics::new());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_unbounded_run() {
        let clock = fake_clock();
        let mut pinger = pinger(&clock, 0);
        let mut report = pinger.report().unwrap();
        let stop = pinger.stop_handle();
        let transport = FakeTransport::new(&clock, (0..100).map(|_| echo(1)));

        let task = tokio::spawn(async move {
            let state = pinger.ping_with(TARGET, move || Ok(transport)).await;
            (pinger, state)
        });

        let mut outcomes = Vec::new();
        while let Some(outcome) = report.outcomes.recv().await {
            outcomes.push(outcome);
            if outcomes.len() == 2 {
                stop.stop();
            }
        }

        let (pinger, state) = task.await.unwrap();
        assert_eq!(state.unwrap(), PingerState::Stopped);
        assert!(outcomes.len() >= 2);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.sequence, i as u64);
        }
        assert_eq!(pinger.stats().transmitted(), outcomes.len() as u64);

        // Stopping a finished run is a no-op
        stop.stop();
        assert_eq!(pinger.state(), PingerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_fails_run() {
        let clock = fake_clock();
        let mut pinger = pinger(&clock, 3);
        let mut report = pinger.report().unwrap();
        let mut transport = FakeTransport::new(&clock, []);
        transport.fail_send = true;

        let state = pinger.ping_with(TARGET, move || Ok(transport)).await.unwrap();

        assert_eq!(state, PingerState::Failed);
        assert!(report.outcomes.recv().await.is_none());
        assert!(matches!(
            report.error.await,
            Ok(PingError::Send { sequence: 0, .. })
        ));
        assert_eq!(pinger.stats().transmitted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_failure_after_outcomes() {
        let clock = fake_clock();
        let mut pinger = pinger(&clock, 5);
        let mut report = pinger.report().unwrap();
        let transport = FakeTransport::new(&clock, [echo(3), Step::Fail]);

        let state = pinger.ping_with(TARGET, move || Ok(transport)).await.unwrap();

        assert_eq!(state, PingerState::Failed);
        assert_eq!(drain(&mut report).len(), 1);
        assert!(matches!(
            report.error.await,
            Ok(PingError::Receive { sequence: 1, .. })
        ));
        assert_eq!(pinger.stats().transmitted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_report_is_released_at_start() {
        let clock = fake_clock();
        let mut pinger = pinger(&clock, 3);
        let transport = FakeTransport::new(&clock, [echo(1), echo(2), echo(3)]);

        let state = pinger.ping_with(TARGET, move || Ok(transport)).await.unwrap();

        assert_eq!(state, PingerState::Stopped);
        assert!(pinger.report().is_none());
        assert_eq!(pinger.stats().received(), 3);
    }

    #[tokio::test]
    async fn test_open_failure_and_restart() {
        let clock = fake_clock();
        let mut pinger = pinger(&clock, 1);
        let report = pinger.report().unwrap();
        assert!(pinger.report().is_none());

        let state = pinger
            .ping_with(TARGET, || -> io::Result<FakeTransport> {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "raw sockets need privileges"))
            })
            .await
            .unwrap();

        assert_eq!(state, PingerState::Failed);
        assert!(matches!(report.error.await, Ok(PingError::TransportOpen(_))));

        let again = pinger
            .ping_with(TARGET, || Ok(FakeTransport::new(&clock, [])))
            .await;
        assert!(matches!(again, Err(PingError::AlreadyStarted)));
    }

    #[test]
    fn test_requests_carry_identifier_and_sequence() {
        let clock = fake_clock();
        let pinger = pinger(&clock, 1);
        let request = encode_echo_request(pinger.identifier(), 9, 56, clock.now()).unwrap();
        let packet = IcmpPacket::from_bytes(&request).unwrap();
        assert_eq!(packet.identifier, pinger.identifier());
        assert_eq!(packet.sequence, 9);
        assert_eq!(extract_timestamp(&packet.payload).unwrap(), clock.now());
    }
}
