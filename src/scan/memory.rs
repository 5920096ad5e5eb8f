//! Memory service sweep
//!
//! Probes ReadMemoryByAddress, WriteMemoryByAddress, RequestDownload and
//! RequestUpload over an address/length grid. Transfer requests that
//! answer positively negotiate a maximum block length; later probes cap
//! their access length to the smallest negotiated maximum.

use crate::client::UdsClient;
use crate::scan::{
    classify_probe, MemoryOp, ResultSet, ScanCandidate, ScanMode, ScanOutcome, ScanResult,
    ScanTask,
};
use crate::DiagServerResult;

/// Memory scanner configuration
#[derive(Debug, Clone)]
pub struct MemoryScanConfig {
    /// First probed address
    pub start: u64,
    /// One past the last probed address
    pub end: u64,
    /// Address increment between probes
    pub step: u64,
    /// Access length per probe, before negotiation caps it
    pub length: u32,
    /// Operations probed at every address
    pub ops: Vec<MemoryOp>,
    /// Address field width in bytes (1..=8)
    pub addr_width: u8,
    /// Length field width in bytes (1..=4)
    pub len_width: u8,
}

impl Default for MemoryScanConfig {
    fn default() -> Self {
        Self {
            start: 0,
            end: 0x1_0000,
            step: 0x1000,
            length: 4,
            ops: vec![MemoryOp::Read],
            addr_width: 4,
            len_width: 4,
        }
    }
}

impl MemoryScanConfig {
    /// addressAndLengthFormatIdentifier for the configured field widths
    pub fn alfid(&self) -> u8 {
        (self.len_width << 4) | (self.addr_width & 0x0F)
    }
}

/// Memory access scanner
#[derive(Debug)]
pub struct MemoryScan {
    cfg: MemoryScanConfig,
    cursor: u64,
    op_index: usize,
    /// Smallest maxNumberOfBlockLength a transfer request negotiated
    negotiated_max: Option<u64>,
}

impl MemoryScan {
    /// Creates the scanner. Field widths outside the ALFID-encodable
    /// ranges are clamped to 1..=8 address bytes and 1..=4 length bytes.
    pub fn new(mut cfg: MemoryScanConfig) -> Self {
        cfg.addr_width = cfg.addr_width.clamp(1, 8);
        cfg.len_width = cfg.len_width.clamp(1, 4);
        let cursor = cfg.start;
        Self {
            cfg,
            cursor,
            op_index: 0,
            negotiated_max: None,
        }
    }

    fn effective_length(&self) -> u32 {
        match self.negotiated_max {
            Some(max) => (self.cfg.length as u64).min(max.max(1)) as u32,
            None => self.cfg.length,
        }
    }

    fn field_bytes(value: u64, width: u8) -> Vec<u8> {
        value.to_be_bytes()[8 - width as usize..].to_vec()
    }

    fn payload_for(&self, op: MemoryOp, address: u64, length: u32) -> Vec<u8> {
        let mut p = Vec::new();
        if matches!(op, MemoryOp::Download | MemoryOp::Upload) {
            p.push(0x00); // dataFormatIdentifier: no compression, no encryption
        }
        p.push(self.cfg.alfid());
        p.extend_from_slice(&Self::field_bytes(address, self.cfg.addr_width));
        p.extend_from_slice(&Self::field_bytes(length as u64, self.cfg.len_width));
        if op == MemoryOp::Write {
            p.extend(std::iter::repeat(0x00).take(length as usize));
        }
        p
    }

    /// Extracts maxNumberOfBlockLength from a positive RequestDownload
    /// or RequestUpload response
    fn parse_block_length(data: &[u8]) -> Option<u64> {
        let (&lfid, rest) = data.split_first()?;
        let width = (lfid >> 4) as usize;
        if width == 0 || width > 8 || rest.len() < width {
            return None;
        }
        let mut value = 0u64;
        for &b in &rest[..width] {
            value = (value << 8) | u64::from(b);
        }
        Some(value)
    }
}

impl ScanTask for MemoryScan {
    fn mode(&self) -> ScanMode {
        ScanMode::Memory
    }

    fn next(&mut self, _produced: &ResultSet) -> Option<ScanCandidate> {
        if self.cfg.step == 0 || self.cfg.ops.is_empty() {
            return None;
        }
        if self.op_index >= self.cfg.ops.len() {
            self.op_index = 0;
            self.cursor = self.cursor.checked_add(self.cfg.step)?;
        }
        if self.cursor >= self.cfg.end {
            return None;
        }
        let op = self.cfg.ops[self.op_index];
        self.op_index += 1;
        Some(ScanCandidate::Memory {
            op,
            address: self.cursor,
            length: self.effective_length(),
        })
    }

    fn step(
        &mut self,
        client: &UdsClient,
        candidate: &ScanCandidate,
    ) -> DiagServerResult<ScanResult> {
        let ScanCandidate::Memory {
            op,
            address,
            length,
        } = *candidate
        else {
            return Err(crate::DiagError::ProtocolViolation(
                "memory scanner fed a foreign candidate".into(),
            ));
        };
        let payload = self.payload_for(op, address, length);
        let result = classify_probe(
            client,
            ScanMode::Memory,
            candidate.clone(),
            op.service(),
            None,
            &payload,
        )?;

        if matches!(op, MemoryOp::Download | MemoryOp::Upload) {
            if let ScanOutcome::Positive { data } = &result.outcome {
                if let Some(max) = Self::parse_block_length(data) {
                    let capped = self.negotiated_max.map_or(max, |m| m.min(max));
                    if self.negotiated_max != Some(capped) {
                        log::info!("ECU negotiated a max block length of {capped} bytes");
                        self.negotiated_max = Some(capped);
                    }
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_iterates_ops_per_address() {
        let cfg = MemoryScanConfig {
            start: 0,
            end: 0x2000,
            step: 0x1000,
            ops: vec![MemoryOp::Read, MemoryOp::Upload],
            ..Default::default()
        };
        let mut scan = MemoryScan::new(cfg);
        let empty = ResultSet::new(ScanMode::Memory);
        let mut seen = Vec::new();
        while let Some(ScanCandidate::Memory { op, address, .. }) = scan.next(&empty) {
            seen.push((op, address));
        }
        assert_eq!(
            seen,
            vec![
                (MemoryOp::Read, 0),
                (MemoryOp::Upload, 0),
                (MemoryOp::Read, 0x1000),
                (MemoryOp::Upload, 0x1000),
            ]
        );
    }

    #[test]
    fn rmba_payload_layout() {
        let scan = MemoryScan::new(MemoryScanConfig::default());
        let p = scan.payload_for(MemoryOp::Read, 0xDEAD_BEEF, 4);
        assert_eq!(p, vec![0x44, 0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x00, 0x00, 0x04]);
    }

    #[test]
    fn download_payload_carries_the_format_identifier() {
        let scan = MemoryScan::new(MemoryScanConfig::default());
        let p = scan.payload_for(MemoryOp::Download, 0x1000, 8);
        assert_eq!(p[0], 0x00);
        assert_eq!(p[1], 0x44);
        assert_eq!(p.len(), 2 + 4 + 4);
    }

    #[test]
    fn out_of_range_field_widths_are_clamped() {
        let scan = MemoryScan::new(MemoryScanConfig {
            addr_width: 12,
            len_width: 0,
            ..Default::default()
        });
        let p = scan.payload_for(MemoryOp::Read, 0x1234, 2);
        // 8 address bytes, 1 length byte
        assert_eq!(p[0], 0x18);
        assert_eq!(p.len(), 1 + 8 + 1);
        assert_eq!(&p[1..9], &[0, 0, 0, 0, 0, 0, 0x12, 0x34]);
        assert_eq!(p[9], 2);
    }

    #[test]
    fn negotiated_block_length_caps_later_probes() {
        let mut scan = MemoryScan::new(MemoryScanConfig {
            length: 64,
            ..Default::default()
        });
        assert_eq!(scan.effective_length(), 64);
        scan.negotiated_max = MemoryScan::parse_block_length(&[0x20, 0x00, 0x10]);
        assert_eq!(scan.negotiated_max, Some(0x10));
        assert_eq!(scan.effective_length(), 0x10);
    }
}
