//! Security seed collection
//!
//! Repeatedly requests seeds for one security level and records the raw
//! seed bytes in order, for offline entropy/PRNG analysis. The run ends
//! after a configured number of seeds or once the configured duration
//! has elapsed, whichever comes first. An ECU that throttles seed
//! requests with requiredTimeDelayNotExpired is given the configured
//! pause before the next request.

use std::time::{Duration, Instant};

use automotive_diag::uds::{UdsCommand, UdsError};

use crate::client::UdsClient;
use crate::scan::{
    classify_probe, ResultSet, ScanCandidate, ScanMode, ScanOutcome, ScanResult, ScanTask,
};
use crate::DiagServerResult;

/// Seed scanner configuration
#[derive(Debug, Clone)]
pub struct SeedScanConfig {
    /// Security level (odd) seeds are requested for
    pub level: u8,
    /// Number of seeds to collect; zero means duration-bound only
    pub count: u32,
    /// Overall collection time budget
    pub duration: Duration,
    /// Pause after a requiredTimeDelayNotExpired refusal
    pub time_delay: Duration,
}

impl Default for SeedScanConfig {
    fn default() -> Self {
        Self {
            level: 0x01,
            count: 0,
            duration: Duration::from_secs(10),
            time_delay: Duration::from_millis(500),
        }
    }
}

/// Seed-dump scanner
#[derive(Debug)]
pub struct SeedScan {
    cfg: SeedScanConfig,
    index: u32,
    started: Option<Instant>,
}

impl SeedScan {
    /// Creates the scanner
    pub fn new(cfg: SeedScanConfig) -> Self {
        Self {
            cfg,
            index: 0,
            started: None,
        }
    }
}

impl ScanTask for SeedScan {
    fn mode(&self) -> ScanMode {
        ScanMode::Seeds
    }

    fn next(&mut self, _produced: &ResultSet) -> Option<ScanCandidate> {
        let started = *self.started.get_or_insert_with(Instant::now);
        if self.cfg.count > 0 && self.index >= self.cfg.count {
            return None;
        }
        if started.elapsed() >= self.cfg.duration {
            return None;
        }
        let candidate = ScanCandidate::Seed {
            index: self.index,
            level: self.cfg.level,
        };
        self.index += 1;
        Some(candidate)
    }

    fn step(
        &mut self,
        client: &UdsClient,
        candidate: &ScanCandidate,
    ) -> DiagServerResult<ScanResult> {
        let ScanCandidate::Seed { level, .. } = *candidate else {
            return Err(crate::DiagError::ProtocolViolation(
                "seed scanner fed a foreign candidate".into(),
            ));
        };
        let result = classify_probe(
            client,
            ScanMode::Seeds,
            candidate.clone(),
            UdsCommand::SecurityAccess.into(),
            Some(level),
            &[],
        )?;
        if result.outcome
            == (ScanOutcome::Negative {
                nrc: UdsError::RequiredTimeDelayNotExpired.into(),
            })
        {
            log::debug!("ECU enforces a seed request delay, pausing {:?}", self.cfg.time_delay);
            std::thread::sleep(self.cfg.time_delay);
        }
        Ok(result)
    }
}

/// Collected seed byte sequences in request order. The level echo byte
/// the ECU prefixes to each seed is stripped.
pub fn collected_seeds(results: &ResultSet) -> Vec<Vec<u8>> {
    results
        .results()
        .iter()
        .filter_map(|r| match (&r.candidate, &r.outcome) {
            (ScanCandidate::Seed { level, .. }, ScanOutcome::Positive { data }) => {
                match data.split_first() {
                    Some((&echo, seed)) if echo == *level => Some(seed.to_vec()),
                    _ => Some(data.clone()),
                }
            }
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_bound_ends_the_run() {
        let mut scan = SeedScan::new(SeedScanConfig {
            level: 0x01,
            count: 3,
            duration: Duration::from_secs(60),
            ..Default::default()
        });
        let empty = ResultSet::new(ScanMode::Seeds);
        let mut indices = Vec::new();
        while let Some(ScanCandidate::Seed { index, .. }) = scan.next(&empty) {
            indices.push(index);
        }
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn duration_bound_ends_the_run() {
        let mut scan = SeedScan::new(SeedScanConfig {
            level: 0x01,
            count: 0,
            duration: Duration::ZERO,
            ..Default::default()
        });
        assert!(scan.next(&ResultSet::new(ScanMode::Seeds)).is_none());
    }

    #[test]
    fn seed_extraction_strips_the_level_echo() {
        let mut set = ResultSet::new(ScanMode::Seeds);
        set.push(ScanResult {
            mode: ScanMode::Seeds,
            candidate: ScanCandidate::Seed { index: 0, level: 1 },
            outcome: ScanOutcome::Positive {
                data: vec![0x01, 0xCA, 0xFE],
            },
            latency: Duration::ZERO,
            session: 1,
            retries: 0,
        });
        set.push(ScanResult {
            mode: ScanMode::Seeds,
            candidate: ScanCandidate::Seed { index: 1, level: 1 },
            outcome: ScanOutcome::Negative { nrc: 0x37 },
            latency: Duration::ZERO,
            session: 1,
            retries: 0,
        });
        assert_eq!(collected_seeds(&set), vec![vec![0xCA, 0xFE]]);
    }
}
