//! Service id sweep
//!
//! Probes the request service id space per configured session. A service
//! is supported when the ECU answers with anything other than
//! serviceNotSupported; the raw NRC is kept in the record so callers can
//! distinguish "supported but refused here" from "unknown".

use std::collections::HashSet;

use automotive_diag::uds::UdsCommand;

use crate::client::UdsClient;
use crate::scan::{
    classify_probe, ResultSet, ScanCandidate, ScanMode, ScanOutcome, ScanResult, ScanTask,
};
use crate::{DiagError, DiagServerResult};

/// Service scanner configuration
#[derive(Debug, Clone)]
pub struct ServiceScanConfig {
    /// Sessions the sweep is repeated in
    pub sessions: Vec<u8>,
    /// Service ids to probe
    pub sids: Vec<u8>,
}

impl Default for ServiceScanConfig {
    fn default() -> Self {
        Self {
            sessions: vec![crate::client::DEFAULT_SESSION],
            // The 0x40..=0x7F block is the response id range and can
            // never appear in a request
            sids: (0x00..=0x3F).chain(0x80..=0xBF).collect(),
        }
    }
}

/// Per-session service id scanner
#[derive(Debug)]
pub struct ServiceScan {
    cfg: ServiceScanConfig,
    cursor: usize,
    dead_sessions: HashSet<u8>,
}

impl ServiceScan {
    /// Creates the scanner
    pub fn new(cfg: ServiceScanConfig) -> Self {
        Self {
            cfg,
            cursor: 0,
            dead_sessions: HashSet::new(),
        }
    }

    fn candidate_at(&self, index: usize) -> Option<(u8, u8)> {
        let per_session = self.cfg.sids.len();
        if per_session == 0 {
            return None;
        }
        let session = *self.cfg.sessions.get(index / per_session)?;
        let sid = self.cfg.sids[index % per_session];
        Some((session, sid))
    }
}

impl ScanTask for ServiceScan {
    fn mode(&self) -> ScanMode {
        ScanMode::Services
    }

    fn next(&mut self, _produced: &ResultSet) -> Option<ScanCandidate> {
        loop {
            let (session, sid) = self.candidate_at(self.cursor)?;
            self.cursor += 1;
            if self.dead_sessions.contains(&session) {
                continue;
            }
            return Some(ScanCandidate::Service { session, sid });
        }
    }

    fn step(
        &mut self,
        client: &UdsClient,
        candidate: &ScanCandidate,
    ) -> DiagServerResult<ScanResult> {
        let ScanCandidate::Service { session, sid } = *candidate else {
            return Err(DiagError::ProtocolViolation(
                "service scanner fed a foreign candidate".into(),
            ));
        };

        if client.current_session() != session {
            let entry = match client.request(
                UdsCommand::DiagnosticSessionControl,
                Some(session),
                &[],
            ) {
                Ok(resp) => resp,
                Err(DiagError::Timeout | DiagError::TimeoutExceeded { .. }) => {
                    // An unanswered session entry is a dead session, not
                    // a failed run
                    log::info!("session 0x{session:02X} entry unanswered, skipping its sweep");
                    self.dead_sessions.insert(session);
                    return Ok(ScanResult {
                        mode: ScanMode::Services,
                        candidate: candidate.clone(),
                        outcome: ScanOutcome::NoResponse,
                        latency: std::time::Duration::ZERO,
                        session: client.current_session(),
                        retries: 0,
                    });
                }
                Err(e) => return Err(e),
            };
            if let Some(nrc) = entry.nrc() {
                // Session unreachable: record it once and skip the rest
                // of its sweep
                log::info!("session 0x{session:02X} unreachable, NRC 0x{nrc:02X}");
                self.dead_sessions.insert(session);
                return Ok(ScanResult {
                    mode: ScanMode::Services,
                    candidate: candidate.clone(),
                    outcome: ScanOutcome::Negative { nrc },
                    latency: std::time::Duration::ZERO,
                    session: client.current_session(),
                    retries: 0,
                });
            }
        }

        classify_probe(
            client,
            ScanMode::Services,
            candidate.clone(),
            sid,
            None,
            &[],
        )
    }
}

/// Service ids the ECU did not reject as serviceNotSupported, per the
/// classification rule in the module docs
pub fn supported_services(results: &ResultSet) -> Vec<u8> {
    const SERVICE_NOT_SUPPORTED: u8 = 0x11;
    let mut sids: Vec<u8> = results
        .results()
        .iter()
        .filter_map(|r| match (&r.candidate, &r.outcome) {
            (ScanCandidate::Service { sid, .. }, ScanOutcome::Positive { .. }) => Some(*sid),
            (ScanCandidate::Service { sid, .. }, ScanOutcome::Negative { nrc })
                if *nrc != SERVICE_NOT_SUPPORTED =>
            {
                Some(*sid)
            }
            _ => None,
        })
        .collect();
    sids.sort_unstable();
    sids.dedup();
    sids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{UdsClient, UdsClientConfig};
    use crate::scan::{Connector, ScanOptions, ScanRunner};
    use crate::transport::mock::{MockChannel, MockEcu};
    use std::time::Duration;

    #[test]
    fn unanswered_session_entry_is_recorded_and_skipped() {
        // The ECU never acknowledges DiagnosticSessionControl, so the
        // 0x03 sweep must collapse into one NoResponse record
        let ecu = MockEcu::new(|req: &[u8]| match req[0] {
            0x10 => None,
            sid => Some(vec![0x7F, sid, 0x11]),
        });
        let mut cfg = UdsClientConfig::default();
        cfg.request_timeout = Duration::from_millis(20);
        let connector: Connector = Box::new(move || {
            UdsClient::with_channel(Box::new(MockChannel::new(ecu.clone())), cfg.clone())
        });
        let runner = ScanRunner::new(connector, ScanOptions::default());
        let mut task = ServiceScan::new(ServiceScanConfig {
            sessions: vec![0x01, 0x03],
            sids: vec![0x22, 0x2E],
        });
        let results = runner.run(&mut task).unwrap();

        assert_eq!(results.len(), 3);
        assert!(matches!(
            results.results()[2].candidate,
            ScanCandidate::Service {
                session: 0x03,
                sid: 0x22
            }
        ));
        assert_eq!(results.results()[2].outcome, ScanOutcome::NoResponse);
    }

    #[test]
    fn sweeps_sids_per_session_in_order() {
        let cfg = ServiceScanConfig {
            sessions: vec![0x01, 0x03],
            sids: vec![0x10, 0x22],
        };
        let mut scan = ServiceScan::new(cfg);
        let empty = ResultSet::new(ScanMode::Services);
        let mut seen = Vec::new();
        while let Some(ScanCandidate::Service { session, sid }) = scan.next(&empty) {
            seen.push((session, sid));
        }
        assert_eq!(
            seen,
            vec![(0x01, 0x10), (0x01, 0x22), (0x03, 0x10), (0x03, 0x22)]
        );
    }

    #[test]
    fn default_sid_space_skips_the_response_range() {
        let cfg = ServiceScanConfig::default();
        assert!(!cfg.sids.iter().any(|s| (0x40..=0x7F).contains(s)));
        assert_eq!(cfg.sids.len(), 0x40 + 0x40);
    }
}
