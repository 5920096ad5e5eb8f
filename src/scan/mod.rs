//! Parameter space scanners
//!
//! Every scanner iterates a declared candidate space and issues one
//! request per candidate through a [UdsClient], classifying the outcome
//! as one of positive / negative / no-response / malformed. A single bad
//! exchange never aborts a scan; it is recorded and the scan moves on.
//! Retry exhaustion on a permanently busy ECU is recorded as no-response.
//!
//! [ScanRunner] drives a scanner against a target and owns the failure
//! policy: connection errors trigger a bounded reconnect after which the
//! in-flight candidate is retried, so an interrupted run produces the
//! same result set as an uninterrupted one. Results are append-only and
//! their order within a run is significant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use automotive_diag::uds::ResetType;

use crate::client::{UdsClient, UdsClientConfig};
use crate::pdu::UdsResponse;
use crate::target::EcuTarget;
use crate::{DiagError, DiagServerResult};

pub mod identifiers;
pub mod memory;
pub mod reset;
pub mod seeds;
pub mod services;
pub mod sessions;

/// Scan mode tag
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanMode {
    /// Breadth-first exploration of the session transition graph
    Sessions,
    /// Service id sweep per session
    Services,
    /// ReadDataByIdentifier/WriteDataByIdentifier sweep over a DID range
    Identifiers,
    /// Memory service sweep over an address/length space
    Memory,
    /// Reset sub-function sweep with recovery timing
    Reset,
    /// Repeated security seed collection
    Seeds,
}

/// Memory access operation probed by the memory scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryOp {
    /// ReadMemoryByAddress (0x23)
    Read,
    /// WriteMemoryByAddress (0x3D)
    Write,
    /// RequestDownload (0x34)
    Download,
    /// RequestUpload (0x35)
    Upload,
}

impl MemoryOp {
    /// Service id of the probed operation
    pub fn service(self) -> u8 {
        match self {
            MemoryOp::Read => 0x23,
            MemoryOp::Write => 0x3D,
            MemoryOp::Download => 0x34,
            MemoryOp::Upload => 0x35,
        }
    }
}

/// One point in a probed parameter space
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanCandidate {
    /// A session transition path starting from the default session
    Session {
        /// Session ids entered in order, ending in the probed session
        path: Vec<u8>,
    },
    /// A service id probed in a given session
    Service {
        /// Session the probe was issued in
        session: u8,
        /// Probed service id
        sid: u8,
    },
    /// A data identifier
    Identifier {
        /// Probed identifier
        did: u16,
        /// True for a WriteDataByIdentifier probe
        write: bool,
    },
    /// A memory operation on an address/length pair
    Memory {
        /// Probed operation
        op: MemoryOp,
        /// Start address
        address: u64,
        /// Access length in bytes
        length: u32,
    },
    /// An ECUReset sub-function
    Reset {
        /// Probed reset sub-function
        sub_function: u8,
    },
    /// One seed request in a seed collection run
    Seed {
        /// Sequence number within the run
        index: u32,
        /// Security level the seed was requested for
        level: u8,
    },
}

/// Outcome classification of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanOutcome {
    /// The ECU answered positively
    Positive {
        /// Response parameter bytes
        data: Vec<u8>,
    },
    /// The ECU refused with a final NRC
    Negative {
        /// Negative response code
        nrc: u8,
    },
    /// The ECU never produced a final answer
    NoResponse,
    /// The ECU sent undecodable bytes
    Malformed {
        /// Raw response bytes
        raw: Vec<u8>,
    },
}

impl ScanOutcome {
    /// True for a positive outcome
    pub fn is_positive(&self) -> bool {
        matches!(self, ScanOutcome::Positive { .. })
    }
}

/// Immutable record of one probed candidate
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanResult {
    /// Mode that produced the record
    pub mode: ScanMode,
    /// Probed candidate
    pub candidate: ScanCandidate,
    /// Outcome classification
    pub outcome: ScanOutcome,
    /// Wall time of the exchange. The reset scanner stores the measured
    /// recovery time here instead.
    pub latency: Duration,
    /// Session that was active when the probe was issued
    pub session: u8,
    /// Wire retries the exchange needed
    pub retries: u32,
}

/// Append-only, ordered collection of results from one run
#[derive(Debug, Clone)]
pub struct ResultSet {
    mode: ScanMode,
    results: Vec<ScanResult>,
    cancelled: bool,
}

impl ResultSet {
    /// Creates an empty result set for a mode
    pub fn new(mode: ScanMode) -> Self {
        Self {
            mode,
            results: Vec::new(),
            cancelled: false,
        }
    }

    /// Mode the set was produced by
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Appends one record. Records are never mutated or removed.
    pub fn push(&mut self, result: ScanResult) {
        self.results.push(result);
    }

    /// All records in scan order
    pub fn results(&self) -> &[ScanResult] {
        &self.results
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// True if no record was produced
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Candidates that got a positive outcome, in scan order
    pub fn positive_candidates(&self) -> impl Iterator<Item = &ScanCandidate> {
        self.results
            .iter()
            .filter(|r| r.outcome.is_positive())
            .map(|r| &r.candidate)
    }

    /// True if the run was cancelled before the space was exhausted
    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }
}

/// External sink results are streamed to as they are produced
pub trait ResultSink {
    /// Called once per record, in scan order
    fn record(&mut self, result: &ScanResult);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ResultSink for NullSink {
    fn record(&mut self, _result: &ScanResult) {}
}

/// Cancellation signal plus optional overall deadline for a run.
///
/// Clones share the same signal, so one clone can be handed to another
/// thread to cancel a running scan.
#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl ScanControl {
    /// Control without a deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Control that cancels the run after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Requests cancellation
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// True once cancelled or past the deadline
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Engine options shared by all scan modes
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Session entered before the first candidate
    pub start_session: u8,
    /// Pause between consecutive candidates
    pub inter_step_gap: Duration,
    /// No-response streak that triggers a reconnect
    pub max_consecutive_failures: u32,
    /// Total reconnects allowed per run before the run fails
    pub reconnect_attempts: u32,
    /// Issue a hard ECU reset after every reconnect
    pub reset_on_reconnect: bool,
    /// Cancellation and deadline signal
    pub control: ScanControl,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            start_session: crate::client::DEFAULT_SESSION,
            inter_step_gap: Duration::ZERO,
            max_consecutive_failures: 3,
            reconnect_attempts: 3,
            reset_on_reconnect: false,
            control: ScanControl::new(),
        }
    }
}

/// One scan mode's candidate generation and probing logic.
///
/// The runner owns ordering, reconnects and cancellation; a task only
/// decides what to probe next and how to probe it.
pub trait ScanTask {
    /// Mode tag of the task
    fn mode(&self) -> ScanMode;

    /// Yields the next candidate, given everything recorded so far.
    /// `None` ends the run.
    fn next(&mut self, produced: &ResultSet) -> Option<ScanCandidate>;

    /// Probes one candidate. Connection errors bubble up so the runner
    /// can reconnect and retry the same candidate.
    fn step(&mut self, client: &UdsClient, candidate: &ScanCandidate)
        -> DiagServerResult<ScanResult>;
}

/// Builds the task for a mode with its default configuration. This is
/// the full registry of available modes; adding a mode means adding a
/// variant here, never runtime discovery.
pub fn default_task(mode: ScanMode) -> Box<dyn ScanTask> {
    match mode {
        ScanMode::Sessions => Box::new(sessions::SessionScan::new(Default::default())),
        ScanMode::Services => Box::new(services::ServiceScan::new(Default::default())),
        ScanMode::Identifiers => Box::new(identifiers::IdentifierScan::new(Default::default())),
        ScanMode::Memory => Box::new(memory::MemoryScan::new(Default::default())),
        ScanMode::Reset => Box::new(reset::ResetScan::new(Default::default())),
        ScanMode::Seeds => Box::new(seeds::SeedScan::new(Default::default())),
    }
}

/// Issues one classified probe. Shared by the concrete tasks.
pub(crate) fn classify_probe(
    client: &UdsClient,
    mode: ScanMode,
    candidate: ScanCandidate,
    service: u8,
    sub_function: Option<u8>,
    payload: &[u8],
) -> DiagServerResult<ScanResult> {
    let started = Instant::now();
    let (outcome, retries) = match client.request_with_stats(service, sub_function, payload) {
        Ok((UdsResponse::Positive { data, .. }, s)) => {
            (ScanOutcome::Positive { data }, s.attempts - 1)
        }
        Ok((UdsResponse::Negative { nrc, .. }, s)) => (ScanOutcome::Negative { nrc }, s.attempts - 1),
        Ok((UdsResponse::Malformed(raw), s)) => (ScanOutcome::Malformed { raw }, s.attempts - 1),
        Err(DiagError::Timeout) => (ScanOutcome::NoResponse, 0),
        Err(DiagError::TimeoutExceeded { attempts }) => (ScanOutcome::NoResponse, attempts),
        // Out-of-protocol answers are findings, not run failures: a
        // desynced or adversarial ECU replaying stale responses is
        // exactly the kind of device being probed
        Err(DiagError::ProtocolViolation(msg)) => {
            log::warn!("probe answered out of protocol: {msg}");
            (ScanOutcome::Malformed { raw: Vec::new() }, 0)
        }
        Err(DiagError::MalformedResponse(raw)) => (ScanOutcome::Malformed { raw }, 0),
        Err(e) => return Err(e),
    };
    Ok(ScanResult {
        mode,
        candidate,
        outcome,
        latency: started.elapsed(),
        session: client.current_session(),
        retries,
    })
}

/// Produces a fresh connection to the scanned ECU
pub type Connector = Box<dyn Fn() -> DiagServerResult<UdsClient>>;

/// Drives one [ScanTask] against one ECU
pub struct ScanRunner {
    connector: Connector,
    options: ScanOptions,
}

impl std::fmt::Debug for ScanRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanRunner")
            .field("options", &self.options)
            .finish()
    }
}

impl ScanRunner {
    /// Runner over an arbitrary connection factory
    pub fn new(connector: Connector, options: ScanOptions) -> Self {
        Self { connector, options }
    }

    /// Runner that reconnects by re-dialling the given target
    pub fn for_target(target: &EcuTarget, cfg: UdsClientConfig, options: ScanOptions) -> Self {
        let target = target.clone();
        Self::new(
            Box::new(move || UdsClient::connect(&target, cfg.clone())),
            options,
        )
    }

    /// Runs the task to completion, cancellation or a fatal error.
    pub fn run(&self, task: &mut dyn ScanTask) -> DiagServerResult<ResultSet> {
        self.run_with_sink(task, &mut NullSink)
    }

    /// Like [ScanRunner::run], streaming every record to `sink` as soon
    /// as it is produced.
    pub fn run_with_sink(
        &self,
        task: &mut dyn ScanTask,
        sink: &mut dyn ResultSink,
    ) -> DiagServerResult<ResultSet> {
        let mut reconnects_used = 0u32;
        let mut client = (self.connector)()?;
        self.enter_start_session(&client)?;

        let mut results = ResultSet::new(task.mode());
        let mut no_response_streak = 0u32;

        while let Some(candidate) = task.next(&results) {
            if self.options.control.is_cancelled() {
                log::info!("{} scan cancelled after {} results", results.mode(), results.len());
                results.mark_cancelled();
                break;
            }

            // Retry the same candidate across reconnects so an
            // interruption neither duplicates nor skips it
            let result = loop {
                match task.step(&client, &candidate) {
                    Ok(r) => break r,
                    Err(e) if e.is_connection_error() => {
                        log::warn!("connection lost while probing {candidate:?}: {e}");
                        client = self.reconnect(&mut reconnects_used)?;
                    }
                    Err(e) => return Err(e),
                }
            };

            if matches!(result.outcome, ScanOutcome::NoResponse) {
                no_response_streak += 1;
            } else {
                no_response_streak = 0;
            }

            sink.record(&result);
            results.push(result);

            if no_response_streak >= self.options.max_consecutive_failures {
                log::warn!(
                    "{no_response_streak} consecutive unanswered probes, reconnecting"
                );
                client = self.reconnect(&mut reconnects_used)?;
                no_response_streak = 0;
            }

            if !self.options.inter_step_gap.is_zero() {
                std::thread::sleep(self.options.inter_step_gap);
            }
        }
        Ok(results)
    }

    fn enter_start_session(&self, client: &UdsClient) -> DiagServerResult<()> {
        let session = self.options.start_session;
        if session == crate::client::DEFAULT_SESSION {
            return Ok(());
        }
        client
            .set_session(session)
            .map_err(|_| DiagError::StartSessionUnreachable(session))
    }

    fn reconnect(&self, used: &mut u32) -> DiagServerResult<UdsClient> {
        loop {
            if *used >= self.options.reconnect_attempts {
                return Err(DiagError::ReconnectExhausted { attempts: *used });
            }
            *used += 1;
            log::info!(
                "reconnect attempt {}/{}",
                *used,
                self.options.reconnect_attempts
            );
            match (self.connector)() {
                Ok(client) => {
                    if self.options.reset_on_reconnect {
                        let _ = client.ecu_reset(ResetType::HardReset);
                    }
                    if self.enter_start_session(&client).is_ok() {
                        return Ok(client);
                    }
                }
                Err(e) if e.is_connection_error() => {
                    log::debug!("reconnect attempt failed: {e}");
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::identifiers::{IdentifierScan, IdentifierScanConfig};
    use crate::transport::mock::{MockChannel, MockEcu};
    use strum::IntoEnumIterator;

    fn mock_runner<F>(handler: F, options: ScanOptions) -> ScanRunner
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let ecu = MockEcu::new(handler);
        ScanRunner::new(
            Box::new(move || {
                UdsClient::with_channel(
                    Box::new(MockChannel::new(ecu.clone())),
                    UdsClientConfig::default(),
                )
            }),
            options,
        )
    }

    #[test]
    fn mode_tags_are_kebab_case() {
        assert_eq!(ScanMode::Sessions.to_string(), "sessions");
        assert_eq!("seeds".parse::<ScanMode>().unwrap(), ScanMode::Seeds);
        assert_eq!(ScanMode::iter().count(), 6);
    }

    #[test]
    fn control_deadline_cancels() {
        let c = ScanControl::with_timeout(Duration::ZERO);
        assert!(c.is_cancelled());
        let c = ScanControl::new();
        assert!(!c.is_cancelled());
        c.clone().cancel();
        assert!(c.is_cancelled());
    }

    #[test]
    fn wrong_service_echo_is_recorded_not_fatal() {
        // The second probe gets a stale response for a different service
        let runner = mock_runner(
            |req: &[u8]| {
                let did = u16::from_be_bytes([req[1], req[2]]);
                if did == 1 {
                    Some(vec![0x51, 0x00])
                } else {
                    Some(vec![0x7F, req[0], 0x31])
                }
            },
            ScanOptions::default(),
        );
        let mut task = IdentifierScan::new(IdentifierScanConfig {
            start: 0,
            end: 5,
            ..Default::default()
        });
        let results = runner.run(&mut task).unwrap();
        assert_eq!(results.len(), 5);
        assert!(matches!(
            results.results()[0].outcome,
            ScanOutcome::Negative { nrc: 0x31 }
        ));
        assert!(matches!(
            results.results()[1].outcome,
            ScanOutcome::Malformed { .. }
        ));
    }

    #[test]
    fn result_set_is_append_only_and_ordered() {
        let mut set = ResultSet::new(ScanMode::Services);
        for sid in [0x10u8, 0x22, 0x27] {
            set.push(ScanResult {
                mode: ScanMode::Services,
                candidate: ScanCandidate::Service { session: 1, sid },
                outcome: ScanOutcome::Positive { data: vec![] },
                latency: Duration::ZERO,
                session: 1,
                retries: 0,
            });
        }
        let sids: Vec<u8> = set
            .positive_candidates()
            .map(|c| match c {
                ScanCandidate::Service { sid, .. } => *sid,
                other => panic!("unexpected candidate {other:?}"),
            })
            .collect();
        assert_eq!(sids, vec![0x10, 0x22, 0x27]);
    }
}
