//! Session transition graph exploration
//!
//! Probes DiagnosticSessionControl transitions breadth-first up to a
//! configured depth. Each candidate is a full transition path from the
//! default session; before probing the final hop the scanner walks the
//! (previously confirmed) prefix again, so every probe is issued from a
//! known session. Negative paths are dead ends and are not extended.

use std::collections::{BTreeSet, VecDeque};

use crate::client::{UdsClient, DEFAULT_SESSION};
use crate::pdu::UdsResponse;
use crate::scan::{
    classify_probe, ResultSet, ScanCandidate, ScanMode, ScanOutcome, ScanResult, ScanTask,
};
use crate::{DiagError, DiagServerResult};

use automotive_diag::uds::UdsCommand;

/// Sessions scanner configuration
#[derive(Debug, Clone)]
pub struct SessionScanConfig {
    /// Maximum number of transitions per path
    pub depth: u32,
    /// Session ids probed at every level of the graph
    pub session_ids: Vec<u8>,
}

impl Default for SessionScanConfig {
    fn default() -> Self {
        Self {
            depth: 2,
            session_ids: (0x02..=0x7F).collect(),
        }
    }
}

/// Breadth-first session transition scanner
#[derive(Debug)]
pub struct SessionScan {
    cfg: SessionScanConfig,
    queue: VecDeque<Vec<u8>>,
    consumed: usize,
}

impl SessionScan {
    /// Creates the scanner with a seeded first level
    pub fn new(cfg: SessionScanConfig) -> Self {
        let queue = if cfg.depth == 0 {
            VecDeque::new()
        } else {
            cfg.session_ids.iter().map(|&s| vec![s]).collect()
        };
        Self {
            cfg,
            queue,
            consumed: 0,
        }
    }

    /// Walks a confirmed path prefix from the default session. Returns
    /// the outcome of the first hop that did not go through, if any.
    fn navigate(
        &self,
        client: &UdsClient,
        prefix: &[u8],
    ) -> DiagServerResult<Option<ScanOutcome>> {
        let hops = std::iter::once(DEFAULT_SESSION).chain(prefix.iter().copied());
        for session in hops {
            let resp = match client.request(UdsCommand::DiagnosticSessionControl, Some(session), &[])
            {
                Ok(resp) => resp,
                Err(DiagError::Timeout | DiagError::TimeoutExceeded { .. }) => {
                    return Ok(Some(ScanOutcome::NoResponse))
                }
                Err(e) => return Err(e),
            };
            match resp {
                UdsResponse::Positive { .. } => {}
                UdsResponse::Negative { nrc, .. } => {
                    return Ok(Some(ScanOutcome::Negative { nrc }))
                }
                UdsResponse::Malformed(raw) => return Ok(Some(ScanOutcome::Malformed { raw })),
            }
        }
        Ok(None)
    }
}

impl ScanTask for SessionScan {
    fn mode(&self) -> ScanMode {
        ScanMode::Sessions
    }

    fn next(&mut self, produced: &ResultSet) -> Option<ScanCandidate> {
        // Extend confirmed paths with one more hop, breadth-first
        for result in &produced.results()[self.consumed..] {
            self.consumed += 1;
            let ScanCandidate::Session { path } = &result.candidate else {
                continue;
            };
            if !result.outcome.is_positive() || path.len() as u32 >= self.cfg.depth {
                continue;
            }
            let tail = *path.last().unwrap_or(&DEFAULT_SESSION);
            for &session in &self.cfg.session_ids {
                if session == tail {
                    continue; // self transitions say nothing new
                }
                let mut extended = path.clone();
                extended.push(session);
                self.queue.push_back(extended);
            }
        }
        self.queue
            .pop_front()
            .map(|path| ScanCandidate::Session { path })
    }

    fn step(
        &mut self,
        client: &UdsClient,
        candidate: &ScanCandidate,
    ) -> DiagServerResult<ScanResult> {
        let ScanCandidate::Session { path } = candidate else {
            return Err(DiagError::ProtocolViolation(
                "sessions scanner fed a foreign candidate".into(),
            ));
        };
        let (&target, prefix) = path.split_last().ok_or_else(|| {
            DiagError::ProtocolViolation("empty session transition path".into())
        })?;

        if let Some(outcome) = self.navigate(client, prefix)? {
            // A previously confirmed hop stopped cooperating; record the
            // path as a dead end rather than aborting the run
            log::warn!("path {path:02X?} broke during navigation: {outcome:?}");
            return Ok(ScanResult {
                mode: ScanMode::Sessions,
                candidate: candidate.clone(),
                outcome,
                latency: std::time::Duration::ZERO,
                session: client.current_session(),
                retries: 0,
            });
        }

        classify_probe(
            client,
            ScanMode::Sessions,
            candidate.clone(),
            UdsCommand::DiagnosticSessionControl.into(),
            Some(target),
            &[],
        )
    }
}

/// Session ids confirmed reachable in a finished sessions run
pub fn reachable_sessions(results: &ResultSet) -> BTreeSet<u8> {
    results
        .positive_candidates()
        .filter_map(|c| match c {
            ScanCandidate::Session { path } => path.last().copied(),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::UdsClientConfig;
    use crate::transport::mock::{MockChannel, MockEcu};
    use std::time::Duration;

    #[test]
    fn silent_prefix_hop_is_a_dead_end_not_a_failure() {
        let ecu = MockEcu::new(|_req: &[u8]| None);
        let mut cfg = UdsClientConfig::default();
        cfg.request_timeout = Duration::from_millis(20);
        let client = UdsClient::with_channel(Box::new(MockChannel::new(ecu)), cfg).unwrap();

        let mut scan = SessionScan::new(SessionScanConfig::default());
        let result = scan
            .step(
                &client,
                &ScanCandidate::Session {
                    path: vec![0x02, 0x03],
                },
            )
            .unwrap();
        assert_eq!(result.outcome, ScanOutcome::NoResponse);
    }

    #[test]
    fn first_level_covers_all_configured_ids() {
        let cfg = SessionScanConfig {
            depth: 1,
            session_ids: vec![0x02, 0x03, 0x60],
        };
        let mut scan = SessionScan::new(cfg);
        let empty = ResultSet::new(ScanMode::Sessions);
        let mut first = Vec::new();
        while let Some(ScanCandidate::Session { path }) = scan.next(&empty) {
            first.push(path);
        }
        assert_eq!(first, vec![vec![0x02], vec![0x03], vec![0x60]]);
    }

    #[test]
    fn positive_paths_are_extended_negative_ones_are_not() {
        let cfg = SessionScanConfig {
            depth: 2,
            session_ids: vec![0x02, 0x03],
        };
        let mut scan = SessionScan::new(cfg);
        let mut produced = ResultSet::new(ScanMode::Sessions);

        let c1 = scan.next(&produced).unwrap();
        assert_eq!(c1, ScanCandidate::Session { path: vec![0x02] });
        produced.push(ScanResult {
            mode: ScanMode::Sessions,
            candidate: c1,
            outcome: ScanOutcome::Positive { data: vec![] },
            latency: std::time::Duration::ZERO,
            session: 0x02,
            retries: 0,
        });

        let c2 = scan.next(&produced).unwrap();
        assert_eq!(c2, ScanCandidate::Session { path: vec![0x03] });
        produced.push(ScanResult {
            mode: ScanMode::Sessions,
            candidate: c2,
            outcome: ScanOutcome::Negative { nrc: 0x12 },
            latency: std::time::Duration::ZERO,
            session: 0x01,
            retries: 0,
        });

        // Only the positive [0x02] path grows a second hop, and only to
        // sessions other than its own tail
        let c3 = scan.next(&produced).unwrap();
        assert_eq!(c3, ScanCandidate::Session { path: vec![0x02, 0x03] });
        assert!(scan.next(&produced).is_none());
    }
}
