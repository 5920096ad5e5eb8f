//! Deterministic virtual ECU
//!
//! [EcuSim] mirrors the session/security state machine from the device
//! side for a declared [EcuProfile]; [VirtualEcu] serves it over the
//! tcp-lines framing so scanners can run against it end to end. Given
//! the same profile seed, every run produces byte-identical behaviour:
//! the profile content is precomputed from a seeded PRNG and the only
//! runtime randomness is the security seed stream, which is itself
//! seeded from the profile.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use automotive_diag::uds::UdsError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::channel::ChannelError;
use crate::client::DEFAULT_SESSION;
use crate::pdu::{NEGATIVE_RESPONSE_SID, POSITIVE_RESPONSE_OFFSET};
use crate::target::{EcuTarget, TcpLinesTarget, TransportAddress, TCP_MTU};
use crate::DiagServerResult;

/// Declared behaviour of a virtual ECU
#[derive(Debug, Clone)]
pub struct EcuProfile {
    /// PRNG seed all generated content derives from
    pub seed: u64,
    /// Sessions the ECU accepts transitions into, from any session
    pub mandatory_sessions: Vec<u8>,
    /// Services the ECU implements at all
    pub services: BTreeSet<u8>,
    /// Supported data identifiers and their record values
    pub identifiers: BTreeMap<u16, Vec<u8>>,
    /// Security levels (odd) that hand out seeds
    pub security_levels: Vec<u8>,
    /// Length of generated security seeds in bytes
    pub seed_len: usize,
}

impl EcuProfile {
    /// Generates a profile deterministically from a seed. The same seed
    /// and session list always produce the same profile.
    pub fn seeded(seed: u64, mandatory_sessions: &[u8]) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut identifiers = BTreeMap::new();
        for did in 0u16..0x0400 {
            if rng.gen_ratio(1, 10) {
                let len = rng.gen_range(1..=8);
                let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                identifiers.insert(did, value);
            }
        }

        let mut services: BTreeSet<u8> =
            [0x10, 0x11, 0x22, 0x27, 0x2E, 0x3E].into_iter().collect();
        for sid in [0x23, 0x34, 0x35, 0x3D] {
            if rng.gen_bool(0.5) {
                services.insert(sid);
            }
        }

        let mut mandatory_sessions = mandatory_sessions.to_vec();
        if !mandatory_sessions.contains(&DEFAULT_SESSION) {
            mandatory_sessions.insert(0, DEFAULT_SESSION);
        }

        Self {
            seed,
            mandatory_sessions,
            services,
            identifiers,
            security_levels: vec![0x01],
            seed_len: 4,
        }
    }

    /// Supported identifiers in ascending order
    pub fn supported_identifiers(&self) -> impl Iterator<Item = u16> + '_ {
        self.identifiers.keys().copied()
    }
}

/// Key the simulator expects for a given seed
pub fn expected_key(seed: &[u8]) -> Vec<u8> {
    seed.iter().map(|b| !b).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SimSecurity {
    Locked,
    SeedGiven { level: u8, seed: Vec<u8> },
    Unlocked(u8),
}

/// Device-side session/security state machine.
///
/// [EcuSim::handle] maps one request PDU to at most one response PDU and
/// can therefore sit directly behind any channel, including the mock
/// channel in unit tests.
#[derive(Debug)]
pub struct EcuSim {
    profile: EcuProfile,
    values: BTreeMap<u16, Vec<u8>>,
    session: u8,
    security: SimSecurity,
    seed_rng: StdRng,
}

impl EcuSim {
    /// Creates a simulator in the default session
    pub fn new(profile: EcuProfile) -> Self {
        let values = profile.identifiers.clone();
        let seed_rng = StdRng::seed_from_u64(profile.seed.wrapping_add(1));
        Self {
            profile,
            values,
            session: DEFAULT_SESSION,
            security: SimSecurity::Locked,
            seed_rng,
        }
    }

    /// Profile the simulator runs
    pub fn profile(&self) -> &EcuProfile {
        &self.profile
    }

    /// Session the simulator is currently in
    pub fn session(&self) -> u8 {
        self.session
    }

    /// Reverts session and security state, as a real ECU does when its
    /// diagnostic connection drops
    pub fn on_disconnect(&mut self) {
        self.session = DEFAULT_SESSION;
        self.security = SimSecurity::Locked;
    }

    /// Handles one request PDU. `None` means the ECU stays silent
    /// (empty input, or a suppressed positive response).
    pub fn handle(&mut self, req: &[u8]) -> Option<Vec<u8>> {
        let (&sid, params) = req.split_first()?;
        if !self.profile.services.contains(&sid) {
            return nrc(sid, UdsError::ServiceNotSupported);
        }
        match sid {
            0x10 => self.session_control(params),
            0x11 => self.ecu_reset(params),
            0x27 => self.security_access(params),
            0x3E => self.tester_present(params),
            0x22 => self.read_did(params),
            0x2E => self.write_did(params),
            0x23 => self.read_memory(params),
            0x3D => self.write_memory(params),
            0x34 | 0x35 => self.transfer_request(sid, params),
            // Declared but otherwise unmodelled services just acknowledge
            _ => positive(sid, &[]),
        }
    }

    fn session_control(&mut self, params: &[u8]) -> Option<Vec<u8>> {
        let [sub] = params else {
            return nrc(0x10, UdsError::IncorrectMessageLengthOrInvalidFormat);
        };
        let target = sub & 0x7F;
        if target == 0 || !self.profile.mandatory_sessions.contains(&target) {
            return nrc(0x10, UdsError::SubFunctionNotSupported);
        }
        self.session = target;
        self.security = SimSecurity::Locked;
        if sub & 0x80 != 0 {
            return None;
        }
        // P2 / P2* timing record: 50 ms, 500 ms
        positive(0x10, &[target, 0x00, 0x32, 0x01, 0xF4])
    }

    fn ecu_reset(&mut self, params: &[u8]) -> Option<Vec<u8>> {
        let [sub] = params else {
            return nrc(0x11, UdsError::IncorrectMessageLengthOrInvalidFormat);
        };
        let reset_type = sub & 0x7F;
        if !(0x01..=0x05).contains(&reset_type) {
            return nrc(0x11, UdsError::SubFunctionNotSupported);
        }
        self.on_disconnect();
        // A reset also discards any written identifier values
        self.values = self.profile.identifiers.clone();
        if sub & 0x80 != 0 {
            return None;
        }
        positive(0x11, &[reset_type])
    }

    fn security_access(&mut self, params: &[u8]) -> Option<Vec<u8>> {
        let Some((&sub, key)) = params.split_first() else {
            return nrc(0x27, UdsError::IncorrectMessageLengthOrInvalidFormat);
        };
        if sub == 0 || sub & 0x80 != 0 {
            return nrc(0x27, UdsError::SubFunctionNotSupported);
        }
        if sub % 2 == 1 {
            // Seed request
            if !self.profile.security_levels.contains(&sub) {
                return nrc(0x27, UdsError::SubFunctionNotSupported);
            }
            if !key.is_empty() {
                return nrc(0x27, UdsError::IncorrectMessageLengthOrInvalidFormat);
            }
            if self.security == SimSecurity::Unlocked(sub) {
                // Already unlocked: an all-zero seed, per ISO 14229
                let mut resp = vec![sub];
                resp.extend(std::iter::repeat(0x00).take(self.profile.seed_len));
                return positive(0x27, &resp);
            }
            let seed: Vec<u8> = (0..self.profile.seed_len)
                .map(|_| self.seed_rng.gen())
                .collect();
            let mut resp = vec![sub];
            resp.extend_from_slice(&seed);
            self.security = SimSecurity::SeedGiven { level: sub, seed };
            positive(0x27, &resp)
        } else {
            // Key exchange
            match std::mem::replace(&mut self.security, SimSecurity::Locked) {
                SimSecurity::SeedGiven { level, seed } if level == sub - 1 => {
                    if key == expected_key(&seed) {
                        self.security = SimSecurity::Unlocked(level);
                        positive(0x27, &[sub])
                    } else {
                        nrc(0x27, UdsError::InvalidKey)
                    }
                }
                other => {
                    self.security = other;
                    nrc(0x27, UdsError::RequestSequenceError)
                }
            }
        }
    }

    fn tester_present(&mut self, params: &[u8]) -> Option<Vec<u8>> {
        match params {
            [0x00] => positive(0x3E, &[0x00]),
            [0x80] => None,
            [_] => nrc(0x3E, UdsError::SubFunctionNotSupported),
            _ => nrc(0x3E, UdsError::IncorrectMessageLengthOrInvalidFormat),
        }
    }

    fn read_did(&mut self, params: &[u8]) -> Option<Vec<u8>> {
        let [hi, lo] = params else {
            return nrc(0x22, UdsError::IncorrectMessageLengthOrInvalidFormat);
        };
        let did = u16::from_be_bytes([*hi, *lo]);
        match self.values.get(&did) {
            Some(value) => {
                let mut resp = did.to_be_bytes().to_vec();
                resp.extend_from_slice(value);
                positive(0x22, &resp)
            }
            None => nrc(0x22, UdsError::RequestOutOfRange),
        }
    }

    fn write_did(&mut self, params: &[u8]) -> Option<Vec<u8>> {
        if params.len() < 3 {
            return nrc(0x2E, UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        if !matches!(self.security, SimSecurity::Unlocked(_)) {
            return nrc(0x2E, UdsError::SecurityAccessDenied);
        }
        let did = u16::from_be_bytes([params[0], params[1]]);
        if !self.values.contains_key(&did) {
            return nrc(0x2E, UdsError::RequestOutOfRange);
        }
        self.values.insert(did, params[2..].to_vec());
        positive(0x2E, &did.to_be_bytes())
    }

    fn read_memory(&mut self, params: &[u8]) -> Option<Vec<u8>> {
        if self.session == DEFAULT_SESSION {
            return nrc(0x23, UdsError::ServiceNotSupportedInActiveSession);
        }
        let Some((_, size, _)) = parse_memory_range(params) else {
            return nrc(0x23, UdsError::IncorrectMessageLengthOrInvalidFormat);
        };
        if size == 0 || size > 0x0FFF {
            return nrc(0x23, UdsError::RequestOutOfRange);
        }
        positive(0x23, &vec![0x00; size as usize])
    }

    fn write_memory(&mut self, params: &[u8]) -> Option<Vec<u8>> {
        if self.session == DEFAULT_SESSION {
            return nrc(0x3D, UdsError::ServiceNotSupportedInActiveSession);
        }
        if !matches!(self.security, SimSecurity::Unlocked(_)) {
            return nrc(0x3D, UdsError::SecurityAccessDenied);
        }
        let Some((_, size, header_len)) = parse_memory_range(params) else {
            return nrc(0x3D, UdsError::IncorrectMessageLengthOrInvalidFormat);
        };
        if params.len() != header_len + size as usize {
            return nrc(0x3D, UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        // Echo alfid, address and size, without the data
        positive(0x3D, &params[..header_len])
    }

    fn transfer_request(&mut self, sid: u8, params: &[u8]) -> Option<Vec<u8>> {
        if self.session == DEFAULT_SESSION {
            return nrc(sid, UdsError::ServiceNotSupportedInActiveSession);
        }
        let Some((_, rest)) = params.split_first() else {
            return nrc(sid, UdsError::IncorrectMessageLengthOrInvalidFormat);
        };
        if parse_memory_range(rest).is_none() {
            return nrc(sid, UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        // lengthFormatIdentifier 0x20: 2 byte maxNumberOfBlockLength
        positive(sid, &[0x20, 0x0F, 0xFF])
    }
}

fn positive(sid: u8, data: &[u8]) -> Option<Vec<u8>> {
    let mut resp = Vec::with_capacity(1 + data.len());
    resp.push(sid + POSITIVE_RESPONSE_OFFSET);
    resp.extend_from_slice(data);
    Some(resp)
}

fn nrc(sid: u8, code: UdsError) -> Option<Vec<u8>> {
    Some(vec![NEGATIVE_RESPONSE_SID, sid, code.into()])
}

/// Parses `[alfid] [address] [size]`, returning address, size and the
/// number of bytes the three fields consumed
fn parse_memory_range(params: &[u8]) -> Option<(u64, u64, usize)> {
    let (&alfid, rest) = params.split_first()?;
    let addr_w = (alfid & 0x0F) as usize;
    let size_w = (alfid >> 4) as usize;
    if addr_w == 0 || addr_w > 8 || size_w == 0 || size_w > 8 || rest.len() < addr_w + size_w {
        return None;
    }
    let read_be = |bytes: &[u8]| bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    let address = read_be(&rest[..addr_w]);
    let size = read_be(&rest[addr_w..addr_w + size_w]);
    Some((address, size, 1 + addr_w + size_w))
}

/// Virtual ECU server speaking the tcp-lines framing.
///
/// Serves at most one client connection at a time; a new connection
/// reverts the simulator to the default session, like a reconnected
/// physical ECU.
#[derive(Debug)]
pub struct VirtualEcu {
    listener: TcpListener,
    sim: EcuSim,
    running: Arc<AtomicBool>,
}

/// Handle to a spawned [VirtualEcu]. Stops the server on drop.
#[derive(Debug)]
pub struct VirtualEcuHandle {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl VirtualEcu {
    /// Binds the server. Use port 0 to let the OS pick a free port.
    pub fn bind(addr: &str, profile: EcuProfile) -> DiagServerResult<Self> {
        let listener = TcpListener::bind(addr).map_err(ChannelError::from)?;
        listener.set_nonblocking(true).map_err(ChannelError::from)?;
        Ok(Self {
            listener,
            sim: EcuSim::new(profile),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Bound address of the server
    pub fn local_addr(&self) -> DiagServerResult<SocketAddr> {
        Ok(self.listener.local_addr().map_err(ChannelError::from)?)
    }

    /// Moves the server onto a background thread
    pub fn spawn(self) -> DiagServerResult<VirtualEcuHandle> {
        let addr = self.local_addr()?;
        let running = self.running.clone();
        let thread = std::thread::spawn(move || self.serve());
        Ok(VirtualEcuHandle {
            addr,
            running,
            thread: Some(thread),
        })
    }

    fn serve(mut self) {
        log::info!("virtual ECU listening on {:?}", self.listener.local_addr());
        while self.running.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!("virtual ECU client connected from {peer}");
                    self.sim.on_disconnect();
                    if let Err(e) = self.serve_client(stream) {
                        log::debug!("virtual ECU client gone: {e}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    log::error!("virtual ECU accept failed: {e}");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn serve_client(&mut self, mut stream: TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_millis(100)))?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut line = String::new();
        while self.running.load(Ordering::Relaxed) {
            match reader.read_line(&mut line) {
                Ok(0) => return Ok(()),
                Ok(_) => {
                    let trimmed = line.trim();
                    match hex::decode(trimmed) {
                        Ok(req) => {
                            if let Some(resp) = self.sim.handle(&req) {
                                let mut out = hex::encode(&resp);
                                out.push('\n');
                                stream.write_all(out.as_bytes())?;
                            }
                        }
                        Err(_) => log::warn!("virtual ECU ignoring bad hex line '{trimmed}'"),
                    }
                    line.clear();
                }
                // A timeout mid-line must keep the partial line buffered
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl VirtualEcuHandle {
    /// Bound address of the server
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Target URI configuration pointing at this server
    pub fn target(&self) -> EcuTarget {
        EcuTarget {
            address: TransportAddress::TcpLines(TcpLinesTarget {
                host: self.addr.ip().to_string(),
                port: self.addr.port(),
            }),
            mtu: TCP_MTU,
            request_gap: Duration::ZERO,
            connect_timeout: Duration::from_millis(2000),
        }
    }

    /// Stops the server and waits for its thread
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for VirtualEcuHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> EcuSim {
        EcuSim::new(EcuProfile::seeded(3, &[1, 2, 3]))
    }

    #[test]
    fn profiles_with_the_same_seed_are_identical() {
        let a = EcuProfile::seeded(3, &[1, 2, 3]);
        let b = EcuProfile::seeded(3, &[1, 2, 3]);
        assert_eq!(a.identifiers, b.identifiers);
        assert_eq!(a.services, b.services);
        let c = EcuProfile::seeded(4, &[1, 2, 3]);
        assert_ne!(a.identifiers, c.identifiers);
    }

    #[test]
    fn session_transitions_follow_the_profile() {
        let mut sim = sim();
        assert_eq!(sim.handle(&[0x10, 0x02]), Some(vec![0x50, 0x02, 0x00, 0x32, 0x01, 0xF4]));
        assert_eq!(sim.session(), 0x02);
        // 0x60 is not a mandatory session
        assert_eq!(sim.handle(&[0x10, 0x60]), Some(vec![0x7F, 0x10, 0x12]));
        assert_eq!(sim.session(), 0x02);
        // Suppressed positive response stays silent but transitions
        assert_eq!(sim.handle(&[0x10, 0x83]), None);
        assert_eq!(sim.session(), 0x03);
    }

    #[test]
    fn unknown_service_is_rejected_as_not_supported() {
        let mut sim = sim();
        assert_eq!(sim.handle(&[0x31, 0x01]), Some(vec![0x7F, 0x31, 0x11]));
    }

    #[test]
    fn seed_then_key_unlocks_and_wrong_key_locks() {
        let mut sim = sim();
        // Key before seed is a sequence error
        assert_eq!(sim.handle(&[0x27, 0x02, 0x00]), Some(vec![0x7F, 0x27, 0x24]));

        let seed_resp = sim.handle(&[0x27, 0x01]).unwrap();
        assert_eq!(&seed_resp[..2], &[0x67, 0x01]);
        let seed = seed_resp[2..].to_vec();
        assert_eq!(seed.len(), 4);

        // Wrong key locks again and the next attempt needs a new seed
        let mut bad = vec![0x27, 0x02];
        bad.extend(seed.iter().map(|b| b ^ 0x55));
        assert_eq!(sim.handle(&bad), Some(vec![0x7F, 0x27, 0x35]));
        assert_eq!(sim.handle(&[0x27, 0x02, 0x00]), Some(vec![0x7F, 0x27, 0x24]));

        let seed2 = sim.handle(&[0x27, 0x01]).unwrap()[2..].to_vec();
        let mut good = vec![0x27, 0x02];
        good.extend(expected_key(&seed2));
        assert_eq!(sim.handle(&good), Some(vec![0x67, 0x02]));

        // Unlocked: further seed requests are all zeros
        assert_eq!(sim.handle(&[0x27, 0x01]), Some(vec![0x67, 0x01, 0, 0, 0, 0]));
    }

    #[test]
    fn write_requires_security_access() {
        let mut sim = sim();
        let did = sim.profile().supported_identifiers().next().unwrap();
        let mut req = vec![0x2E];
        req.extend_from_slice(&did.to_be_bytes());
        req.push(0xAB);
        assert_eq!(sim.handle(&req), Some(vec![0x7F, 0x2E, 0x33]));

        let seed = sim.handle(&[0x27, 0x01]).unwrap()[2..].to_vec();
        let mut key = vec![0x27, 0x02];
        key.extend(expected_key(&seed));
        sim.handle(&key).unwrap();

        let resp = sim.handle(&req).unwrap();
        assert_eq!(resp[0], 0x6E);
        // The write is visible to a subsequent read
        let mut read = vec![0x22];
        read.extend_from_slice(&did.to_be_bytes());
        let read_resp = sim.handle(&read).unwrap();
        assert_eq!(read_resp[3..], [0xAB]);
    }

    #[test]
    fn memory_services_need_a_non_default_session() {
        let mut sim = sim();
        if !sim.profile().services.contains(&0x23) {
            return; // this profile rolled RMBA out
        }
        let req = [0x23, 0x44, 0, 0, 0x10, 0, 0, 0, 0, 0x04];
        assert_eq!(sim.handle(&req), Some(vec![0x7F, 0x23, 0x7F]));
        sim.handle(&[0x10, 0x03]).unwrap();
        assert_eq!(sim.handle(&req), Some(vec![0x63, 0, 0, 0, 0]));
    }

    #[test]
    fn disconnect_reverts_session_and_security() {
        let mut sim = sim();
        sim.handle(&[0x10, 0x02]).unwrap();
        assert_eq!(sim.session(), 0x02);
        sim.on_disconnect();
        assert_eq!(sim.session(), DEFAULT_SESSION);
        assert_eq!(sim.handle(&[0x27, 0x02, 0x00]), Some(vec![0x7F, 0x27, 0x24]));
    }
}
