//! Reset sub-function sweep with recovery timing
//!
//! Issues every configured ECUReset sub-function and, when the ECU
//! accepts, measures how long it takes to answer diagnostics again by
//! polling TesterPresent. For accepted resets the record's `latency`
//! field holds the measured recovery time; a reset the ECU never comes
//! back from is recorded as no-response.

use std::time::{Duration, Instant};

use automotive_diag::uds::UdsCommand;

use crate::client::UdsClient;
use crate::scan::{
    classify_probe, ResultSet, ScanCandidate, ScanMode, ScanOutcome, ScanResult, ScanTask,
};
use crate::{DiagError, DiagServerResult};

/// Reset scanner configuration
#[derive(Debug, Clone)]
pub struct ResetScanConfig {
    /// Reset sub-functions to issue
    pub sub_functions: Vec<u8>,
    /// Pause between responsiveness probes
    pub probe_interval: Duration,
    /// Give up waiting for the ECU after this long
    pub recovery_timeout: Duration,
}

impl Default for ResetScanConfig {
    fn default() -> Self {
        Self {
            // hard, keyOffOn, soft, enable/disable rapid power shutdown
            sub_functions: vec![0x01, 0x02, 0x03, 0x04, 0x05],
            probe_interval: Duration::from_millis(20),
            recovery_timeout: Duration::from_secs(2),
        }
    }
}

/// ECUReset scanner
#[derive(Debug)]
pub struct ResetScan {
    cfg: ResetScanConfig,
    cursor: usize,
}

impl ResetScan {
    /// Creates the scanner
    pub fn new(cfg: ResetScanConfig) -> Self {
        Self { cfg, cursor: 0 }
    }

    /// Polls until the ECU answers diagnostics again, returning the
    /// recovery time, or `None` past the timeout. Connection errors
    /// bubble up for the runner's reconnect handling.
    fn await_recovery(&self, client: &UdsClient) -> DiagServerResult<Option<Duration>> {
        let started = Instant::now();
        while started.elapsed() < self.cfg.recovery_timeout {
            match client.request(UdsCommand::TesterPresent, Some(0x00), &[]) {
                // Any decoded answer, positive or negative, means alive
                Ok(_) => return Ok(Some(started.elapsed())),
                Err(DiagError::Timeout | DiagError::TimeoutExceeded { .. }) => {}
                Err(e) => return Err(e),
            }
            std::thread::sleep(self.cfg.probe_interval);
        }
        Ok(None)
    }
}

impl ScanTask for ResetScan {
    fn mode(&self) -> ScanMode {
        ScanMode::Reset
    }

    fn next(&mut self, _produced: &ResultSet) -> Option<ScanCandidate> {
        let sub_function = *self.cfg.sub_functions.get(self.cursor)?;
        self.cursor += 1;
        Some(ScanCandidate::Reset { sub_function })
    }

    fn step(
        &mut self,
        client: &UdsClient,
        candidate: &ScanCandidate,
    ) -> DiagServerResult<ScanResult> {
        let ScanCandidate::Reset { sub_function } = *candidate else {
            return Err(DiagError::ProtocolViolation(
                "reset scanner fed a foreign candidate".into(),
            ));
        };
        let mut result = classify_probe(
            client,
            ScanMode::Reset,
            candidate.clone(),
            UdsCommand::ECUReset.into(),
            Some(sub_function),
            &[],
        )?;

        if result.outcome.is_positive() {
            match self.await_recovery(client)? {
                Some(recovery) => {
                    log::info!(
                        "reset 0x{sub_function:02X} accepted, ECU back after {recovery:?}"
                    );
                    result.latency = recovery;
                }
                None => {
                    log::warn!(
                        "reset 0x{sub_function:02X} accepted but the ECU never came back"
                    );
                    result.outcome = ScanOutcome::NoResponse;
                    result.latency = self.cfg.recovery_timeout;
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::UdsClientConfig;
    use crate::transport::mock::{MockChannel, MockEcu};

    #[test]
    fn accepted_reset_records_recovery_latency() {
        let ecu = MockEcu::new(|req: &[u8]| match req[0] {
            0x11 => Some(vec![0x51, req[1]]),
            0x3E => Some(vec![0x7E, 0x00]),
            _ => None,
        });
        let client = UdsClient::with_channel(
            Box::new(MockChannel::new(ecu.clone())),
            UdsClientConfig::default(),
        )
        .unwrap();

        let mut scan = ResetScan::new(ResetScanConfig {
            sub_functions: vec![0x01],
            ..Default::default()
        });
        let candidate = scan.next(&ResultSet::new(ScanMode::Reset)).unwrap();
        let result = scan.step(&client, &candidate).unwrap();
        assert!(result.outcome.is_positive());
        assert!(result.latency < scan.cfg.recovery_timeout);
    }

    #[test]
    fn refused_reset_skips_the_recovery_probe() {
        let ecu = MockEcu::new(|req: &[u8]| match req[0] {
            0x11 => Some(vec![0x7F, 0x11, 0x22]),
            _ => None,
        });
        let client = UdsClient::with_channel(
            Box::new(MockChannel::new(ecu.clone())),
            UdsClientConfig {
                retry: crate::client::RetryPolicy {
                    retryable_nrcs: vec![],
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap();

        let mut scan = ResetScan::new(ResetScanConfig::default());
        let candidate = scan.next(&ResultSet::new(ScanMode::Reset)).unwrap();
        let result = scan.step(&client, &candidate).unwrap();
        assert_eq!(result.outcome, ScanOutcome::Negative { nrc: 0x22 });
        assert_eq!(ecu.lock().unwrap().count_for_service(0x3E), 0);
    }
}
