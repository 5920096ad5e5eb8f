//! Client side session and security state machine
//!
//! One [UdsClient] owns exactly one channel. The channel lives on a
//! background worker thread; foreground requests and the TesterPresent
//! keepalive are serialized through that thread by message passing, so
//! their bytes can never interleave on the wire.
//!
//! [UdsClient::request] is the single entry point for raw exchanges. It
//! applies the NRC driven retry policy (busy NRCs get bounded backoff,
//! everything else is final), tracks the active diagnostic session and
//! security level, and hands back a decoded [UdsResponse]. Typed helpers
//! such as [UdsClient::set_session] and [UdsClient::request_seed] wrap it
//! for the common services.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use std::time::{Duration, Instant};

use automotive_diag::uds::{ResetType, UdsCommand, UdsError};

use crate::channel::{ChannelError, DiagChannel};
use crate::pdu::{self, UdsRequest, UdsResponse};
use crate::target::EcuTarget;
use crate::{transport, DiagError, DiagServerResult};

/// Session id of the default diagnostic session
pub const DEFAULT_SESSION: u8 = 0x01;
/// Sub-function bit that asks the ECU to suppress its positive response
pub const SUPPRESS_POS_RSP: u8 = 0x80;

/// Security access state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityState {
    /// No security level active
    Locked,
    /// A seed for the given (odd) level was requested, no key sent yet
    SeedRequested(u8),
    /// The key exchange for the given level succeeded
    Unlocked(u8),
}

/// Session id plus security state, the full client side ECU state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    /// Active diagnostic session id
    pub session: u8,
    /// Active security access state
    pub security: SecurityState,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            session: DEFAULT_SESSION,
            security: SecurityState::Locked,
        }
    }
}

/// NRC driven retry configuration.
///
/// Which NRCs count as retryable is deliberately runtime configuration,
/// not a constant: ECUs disagree on how they signal "try again later".
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts before [DiagError::TimeoutExceeded]
    pub max_attempts: u32,
    /// Backoff before the second attempt, doubled per further attempt
    pub backoff_base: Duration,
    /// Upper bound on a single backoff pause
    pub backoff_max: Duration,
    /// NRCs that trigger a retry instead of a final negative response
    pub retryable_nrcs: Vec<u8>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_millis(2000),
            retryable_nrcs: vec![
                UdsError::BusyRepeatRequest.into(),
                UdsError::ConditionsNotCorrect.into(),
            ],
        }
    }
}

impl RetryPolicy {
    /// True if the NRC should be retried with backoff
    pub fn is_retryable(&self, nrc: u8) -> bool {
        self.retryable_nrcs.contains(&nrc)
    }

    /// Pause before the attempt following attempt number `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        (self.backoff_base * 2u32.saturating_pow(exp)).min(self.backoff_max)
    }
}

/// Client configuration, constructed once and handed to [UdsClient]
#[derive(Debug, Clone)]
pub struct UdsClientConfig {
    /// Deadline for the first response bytes of each exchange
    pub request_timeout: Duration,
    /// Deadline restarted whenever the ECU answers response-pending
    pub response_pending_timeout: Duration,
    /// Retry behaviour for retryable NRCs
    pub retry: RetryPolicy,
    /// Idle interval after which TesterPresent is sent to keep a
    /// non-default session alive
    pub tester_present_interval: Duration,
    /// Poll for a TesterPresent response instead of suppressing it
    pub tester_present_require_response: bool,
    /// Pause between consecutive requests on the wire. Zero means the
    /// target's own `request_gap` setting applies.
    pub request_gap: Duration,
}

impl Default for UdsClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(1000),
            response_pending_timeout: Duration::from_millis(5000),
            retry: RetryPolicy::default(),
            tester_present_interval: Duration::from_millis(2000),
            tester_present_require_response: false,
            request_gap: Duration::ZERO,
        }
    }
}

/// Per-exchange bookkeeping, reported alongside the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Wire attempts made, including the successful one
    pub attempts: u32,
    /// Wall time from first send to final response
    pub latency: Duration,
}

/// Client handle to one ECU connection.
///
/// Dropping the client stops the worker thread and closes the channel.
#[derive(Debug)]
pub struct UdsClient {
    sender: mpsc::Sender<Vec<u8>>,
    receiver: mpsc::Receiver<DiagServerResult<Vec<u8>>>,
    running: Arc<AtomicBool>,
    state: Arc<RwLock<SessionState>>,
    mtu: usize,
    cfg: UdsClientConfig,
}

impl UdsClient {
    /// Connects to the target and starts the channel worker
    pub fn connect(target: &EcuTarget, mut cfg: UdsClientConfig) -> DiagServerResult<Self> {
        if cfg.request_gap.is_zero() {
            cfg.request_gap = target.request_gap;
        }
        let channel = transport::connect(target)?;
        Self::with_channel(channel, cfg)
    }

    /// Starts a client over an existing channel. The channel is opened
    /// here if it is not already.
    pub fn with_channel(
        mut channel: Box<dyn DiagChannel>,
        cfg: UdsClientConfig,
    ) -> DiagServerResult<Self> {
        channel.open()?;
        let mtu = channel.mtu();

        let (tx_req, rx_req) = mpsc::channel::<Vec<u8>>();
        let (tx_resp, rx_resp) = mpsc::channel::<DiagServerResult<Vec<u8>>>();
        let running = Arc::new(AtomicBool::new(true));
        let state = Arc::new(RwLock::new(SessionState::default()));

        let worker_cfg = cfg.clone();
        let worker_running = running.clone();
        let worker_state = state.clone();
        std::thread::spawn(move || {
            worker_loop(
                channel,
                rx_req,
                tx_resp,
                worker_running,
                worker_state,
                worker_cfg,
            )
        });

        Ok(Self {
            sender: tx_req,
            receiver: rx_resp,
            running,
            state,
            mtu,
            cfg,
        })
    }

    /// Active diagnostic session id
    pub fn current_session(&self) -> u8 {
        self.state.read().unwrap().session
    }

    /// Active security access state
    pub fn security_state(&self) -> SecurityState {
        self.state.read().unwrap().security
    }

    /// Full session/security state snapshot
    pub fn session_state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    /// MTU of the underlying channel
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Sends one request and decodes the ECU's answer.
    ///
    /// Retryable NRCs are resolved internally with bounded backoff;
    /// exhausting the budget fails with [DiagError::TimeoutExceeded].
    /// Any other negative response is final and returned as a decoded
    /// [UdsResponse::Negative], not as an error.
    pub fn request<S: Into<u8>>(
        &self,
        service: S,
        sub_function: Option<u8>,
        payload: &[u8],
    ) -> DiagServerResult<UdsResponse> {
        self.request_with_stats(service, sub_function, payload)
            .map(|(resp, _)| resp)
    }

    /// Like [UdsClient::request], additionally reporting attempt count
    /// and latency for the exchange
    pub fn request_with_stats<S: Into<u8>>(
        &self,
        service: S,
        sub_function: Option<u8>,
        payload: &[u8],
    ) -> DiagServerResult<(UdsResponse, ExchangeStats)> {
        let req = UdsRequest::new(service, sub_function, payload);
        let wire = req.encode(self.mtu)?;
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let raw = self.wire_exchange(wire.clone())?;
            let resp = UdsResponse::decode(&raw);
            let stats = ExchangeStats {
                attempts,
                latency: started.elapsed(),
            };
            match &resp {
                UdsResponse::Positive { service: echo, .. } => {
                    if *echo != req.service {
                        return Err(DiagError::ProtocolViolation(format!(
                            "positive response for service 0x{echo:02X} while 0x{:02X} was in flight",
                            req.service
                        )));
                    }
                    self.apply_positive_transition(&req);
                    return Ok((resp, stats));
                }
                UdsResponse::Negative { service: echo, nrc } => {
                    if *echo != req.service {
                        return Err(DiagError::ProtocolViolation(format!(
                            "negative response for service 0x{echo:02X} while 0x{:02X} was in flight",
                            req.service
                        )));
                    }
                    if self.cfg.retry.is_retryable(*nrc) {
                        if attempts >= self.cfg.retry.max_attempts {
                            return Err(DiagError::TimeoutExceeded { attempts });
                        }
                        let pause = self.cfg.retry.backoff(attempts);
                        log::debug!(
                            "retryable NRC 0x{nrc:02X} on attempt {attempts}, backing off {pause:?}"
                        );
                        std::thread::sleep(pause);
                        continue;
                    }
                    self.apply_negative_transition(&req);
                    return Ok((resp, stats));
                }
                UdsResponse::Malformed(bytes) => {
                    log::warn!("undecodable ECU response: {bytes:02X?}");
                    return Ok((resp, stats));
                }
            }
        }
    }

    /// Switches the diagnostic session, requiring a positive response
    pub fn set_session(&self, session: u8) -> DiagServerResult<()> {
        let resp = self.request(UdsCommand::DiagnosticSessionControl, Some(session), &[])?;
        Self::require_positive(resp).map(|_| ())
    }

    /// Resets the ECU. On success the state machine reverts to the
    /// default session with security locked.
    pub fn ecu_reset(&self, mode: ResetType) -> DiagServerResult<()> {
        let resp = self.request(UdsCommand::ECUReset, Some(mode.into()), &[])?;
        Self::require_positive(resp).map(|_| ())
    }

    /// Sends an explicit TesterPresent, requiring a positive response
    pub fn tester_present(&self) -> DiagServerResult<()> {
        let resp = self.request(UdsCommand::TesterPresent, Some(0x00), &[])?;
        Self::require_positive(resp).map(|_| ())
    }

    /// Requests a security seed for the given (odd) level, returning the
    /// seed bytes
    pub fn request_seed(&self, level: u8) -> DiagServerResult<Vec<u8>> {
        if level % 2 == 0 || level & SUPPRESS_POS_RSP != 0 {
            return Err(DiagError::ProtocolViolation(format!(
                "0x{level:02X} is not a seed request level"
            )));
        }
        let resp = self.request(UdsCommand::SecurityAccess, Some(level), &[])?;
        let data = Self::require_positive(resp)?;
        match data.split_first() {
            Some((&echo, seed)) if echo == level => Ok(seed.to_vec()),
            _ => Err(DiagError::ProtocolViolation(format!(
                "seed response does not echo level 0x{level:02X}"
            ))),
        }
    }

    /// Sends the key for a previously requested seed. Refused locally
    /// unless a seed for exactly this level is outstanding, so a key can
    /// never be sent before its seed.
    pub fn send_key(&self, level: u8, key: &[u8]) -> DiagServerResult<()> {
        if self.security_state() != SecurityState::SeedRequested(level) {
            return Err(DiagError::ProtocolViolation(format!(
                "key for level 0x{level:02X} sent without a prior seed request"
            )));
        }
        let resp = self.request(UdsCommand::SecurityAccess, Some(level + 1), key)?;
        Self::require_positive(resp).map(|_| ())
    }

    /// Reads one data identifier, returning the record bytes
    pub fn read_data_by_identifier(&self, did: u16) -> DiagServerResult<Vec<u8>> {
        let resp = self.request(UdsCommand::ReadDataByIdentifier, None, &did.to_be_bytes())?;
        let data = Self::require_positive(resp)?;
        if data.len() < 2 || data[..2] != did.to_be_bytes() {
            return Err(DiagError::ProtocolViolation(format!(
                "RDBI response does not echo identifier 0x{did:04X}"
            )));
        }
        Ok(data[2..].to_vec())
    }

    /// Writes one data identifier
    pub fn write_data_by_identifier(&self, did: u16, value: &[u8]) -> DiagServerResult<()> {
        let mut payload = did.to_be_bytes().to_vec();
        payload.extend_from_slice(value);
        let resp = self.request(UdsCommand::WriteDataByIdentifier, None, &payload)?;
        Self::require_positive(resp).map(|_| ())
    }

    /// Converts a decoded response into `Ok(data)` or the matching error
    pub fn require_positive(resp: UdsResponse) -> DiagServerResult<Vec<u8>> {
        match resp {
            UdsResponse::Positive { data, .. } => Ok(data),
            UdsResponse::Negative { nrc, .. } => Err(DiagError::EcuError {
                nrc,
                desc: pdu::nrc_description(nrc),
            }),
            UdsResponse::Malformed(bytes) => Err(DiagError::MalformedResponse(bytes)),
        }
    }

    fn wire_exchange(&self, bytes: Vec<u8>) -> DiagServerResult<Vec<u8>> {
        self.sender
            .send(bytes)
            .map_err(|_| DiagError::ServerNotRunning)?;
        self.receiver
            .recv()
            .map_err(|_| DiagError::ServerNotRunning)?
    }

    fn apply_positive_transition(&self, req: &UdsRequest) {
        let mut state = self.state.write().unwrap();
        if req.service == UdsCommand::DiagnosticSessionControl.into() {
            if let Some(sub) = req.sub_function {
                // Session change always drops any security level
                state.session = sub & !SUPPRESS_POS_RSP;
                state.security = SecurityState::Locked;
            }
        } else if req.service == UdsCommand::ECUReset.into() {
            *state = SessionState::default();
        } else if req.service == UdsCommand::SecurityAccess.into() {
            // Sub-function 0x00 is reserved; an ECU acknowledging it
            // positively does not change the security state
            if let Some(sub) = req.sub_function.filter(|&s| s != 0) {
                state.security = if sub % 2 == 1 {
                    SecurityState::SeedRequested(sub)
                } else {
                    SecurityState::Unlocked(sub - 1)
                };
            }
        }
    }

    fn apply_negative_transition(&self, req: &UdsRequest) {
        // A failed key exchange destroys the outstanding seed
        if req.service == UdsCommand::SecurityAccess.into() {
            if let Some(sub) = req.sub_function {
                if sub % 2 == 0 {
                    self.state.write().unwrap().security = SecurityState::Locked;
                }
            }
        }
    }
}

impl Drop for UdsClient {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed)
    }
}

fn worker_loop(
    mut channel: Box<dyn DiagChannel>,
    rx_req: mpsc::Receiver<Vec<u8>>,
    tx_resp: mpsc::Sender<DiagServerResult<Vec<u8>>>,
    running: Arc<AtomicBool>,
    state: Arc<RwLock<SessionState>>,
    cfg: UdsClientConfig,
) {
    let tp_frame: [u8; 2] = if cfg.tester_present_require_response {
        [UdsCommand::TesterPresent.into(), 0x00]
    } else {
        [UdsCommand::TesterPresent.into(), SUPPRESS_POS_RSP]
    };
    let mut last_wire_activity = Instant::now();
    while running.load(Ordering::Relaxed) {
        match rx_req.recv_timeout(Duration::from_millis(10)) {
            Ok(bytes) => {
                wait_request_gap(last_wire_activity, cfg.request_gap);
                let res = exchange(channel.as_mut(), &bytes, &cfg);
                last_wire_activity = Instant::now();
                if tx_resp.send(res).is_err() {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // The default session needs no keepalive
                let session = state.read().unwrap().session;
                if session == DEFAULT_SESSION
                    || last_wire_activity.elapsed() < cfg.tester_present_interval
                {
                    continue;
                }
                let alive = if cfg.tester_present_require_response {
                    matches!(
                        exchange(channel.as_mut(), &tp_frame, &cfg),
                        Ok(raw) if UdsResponse::decode(&raw).is_positive()
                    )
                } else {
                    channel.send(&tp_frame).is_ok()
                };
                if alive {
                    last_wire_activity = Instant::now();
                } else {
                    log::warn!(
                        "TesterPresent failed, assuming the ECU reverted to the default session"
                    );
                    *state.write().unwrap() = SessionState::default();
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    let _ = channel.close();
}

/// One wire attempt: send the request, poll until the final answer.
/// Response-pending NRCs restart the deadline instead of failing.
fn exchange(
    channel: &mut dyn DiagChannel,
    bytes: &[u8],
    cfg: &UdsClientConfig,
) -> DiagServerResult<Vec<u8>> {
    log::debug!("sending request: {bytes:02X?}");
    channel.send(bytes).map_err(wire_err)?;
    let mut timeout = cfg.request_timeout;
    loop {
        let raw = channel.recv(timeout).map_err(wire_err)?;
        if let UdsResponse::Negative { nrc, .. } = UdsResponse::decode(&raw) {
            if pdu::is_response_pending(nrc) {
                log::debug!("ECU signalled response pending, extending the deadline");
                timeout = cfg.response_pending_timeout;
                continue;
            }
        }
        log::debug!("received response: {raw:02X?}");
        return Ok(raw);
    }
}

fn wire_err(e: ChannelError) -> DiagError {
    match e {
        ChannelError::ReadTimeout => DiagError::Timeout,
        other => DiagError::Channel(other),
    }
}

fn wait_request_gap(last_wire_activity: Instant, gap: Duration) {
    if gap.is_zero() {
        return;
    }
    let since = last_wire_activity.elapsed();
    if since < gap {
        std::thread::sleep(gap - since);
    }
}
