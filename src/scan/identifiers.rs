//! Data identifier sweep
//!
//! Probes ReadDataByIdentifier (and optionally WriteDataByIdentifier)
//! over a half-open identifier range, recording the NRC class of every
//! refusal. Writes send a configurable probe payload and are off by
//! default.

use automotive_diag::uds::UdsCommand;

use crate::client::UdsClient;
use crate::scan::{classify_probe, ResultSet, ScanCandidate, ScanMode, ScanResult, ScanTask};
use crate::DiagServerResult;

/// Identifier scanner configuration
#[derive(Debug, Clone)]
pub struct IdentifierScanConfig {
    /// First identifier probed
    pub start: u16,
    /// One past the last identifier probed
    pub end: u32,
    /// Also probe WriteDataByIdentifier for every identifier
    pub write: bool,
    /// Record bytes sent with write probes
    pub write_payload: Vec<u8>,
}

impl Default for IdentifierScanConfig {
    fn default() -> Self {
        Self {
            start: 0x0000,
            end: 0x1_0000,
            write: false,
            write_payload: vec![0x00],
        }
    }
}

/// ReadDataByIdentifier/WriteDataByIdentifier scanner
#[derive(Debug)]
pub struct IdentifierScan {
    cfg: IdentifierScanConfig,
    cursor: u32,
    write_phase: bool,
}

impl IdentifierScan {
    /// Creates the scanner
    pub fn new(cfg: IdentifierScanConfig) -> Self {
        let cursor = cfg.start as u32;
        Self {
            cfg,
            cursor,
            write_phase: false,
        }
    }
}

impl ScanTask for IdentifierScan {
    fn mode(&self) -> ScanMode {
        ScanMode::Identifiers
    }

    fn next(&mut self, _produced: &ResultSet) -> Option<ScanCandidate> {
        if self.cursor >= self.cfg.end {
            if self.write_phase || !self.cfg.write {
                return None;
            }
            // Read sweep done, start over for the write sweep
            self.write_phase = true;
            self.cursor = self.cfg.start as u32;
        }
        let did = self.cursor as u16;
        self.cursor += 1;
        Some(ScanCandidate::Identifier {
            did,
            write: self.write_phase,
        })
    }

    fn step(
        &mut self,
        client: &UdsClient,
        candidate: &ScanCandidate,
    ) -> DiagServerResult<ScanResult> {
        let ScanCandidate::Identifier { did, write } = *candidate else {
            return Err(crate::DiagError::ProtocolViolation(
                "identifier scanner fed a foreign candidate".into(),
            ));
        };
        if write {
            let mut payload = did.to_be_bytes().to_vec();
            payload.extend_from_slice(&self.cfg.write_payload);
            classify_probe(
                client,
                ScanMode::Identifiers,
                candidate.clone(),
                UdsCommand::WriteDataByIdentifier.into(),
                None,
                &payload,
            )
        } else {
            classify_probe(
                client,
                ScanMode::Identifiers,
                candidate.clone(),
                UdsCommand::ReadDataByIdentifier.into(),
                None,
                &did.to_be_bytes(),
            )
        }
    }
}

/// Identifiers that answered positively to the read sweep
pub fn readable_identifiers(results: &ResultSet) -> Vec<u16> {
    results
        .positive_candidates()
        .filter_map(|c| match c {
            ScanCandidate::Identifier { did, write: false } => Some(*did),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_the_half_open_range_once() {
        let cfg = IdentifierScanConfig {
            start: 0x10,
            end: 0x13,
            write: false,
            ..Default::default()
        };
        let mut scan = IdentifierScan::new(cfg);
        let empty = ResultSet::new(ScanMode::Identifiers);
        let mut dids = Vec::new();
        while let Some(ScanCandidate::Identifier { did, .. }) = scan.next(&empty) {
            dids.push(did);
        }
        assert_eq!(dids, vec![0x10, 0x11, 0x12]);
    }

    #[test]
    fn write_mode_repeats_the_range_with_the_write_flag() {
        let cfg = IdentifierScanConfig {
            start: 0,
            end: 2,
            write: true,
            ..Default::default()
        };
        let mut scan = IdentifierScan::new(cfg);
        let empty = ResultSet::new(ScanMode::Identifiers);
        let mut seen = Vec::new();
        while let Some(ScanCandidate::Identifier { did, write }) = scan.next(&empty) {
            seen.push((did, write));
        }
        assert_eq!(
            seen,
            vec![(0, false), (1, false), (0, true), (1, true)]
        );
    }
}
