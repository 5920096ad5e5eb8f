//! Scanner runs against the virtual ECU, end to end

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use udscan::client::{UdsClient, UdsClientConfig};
use udscan::scan::identifiers::{readable_identifiers, IdentifierScan, IdentifierScanConfig};
use udscan::scan::services::{supported_services, ServiceScan, ServiceScanConfig};
use udscan::scan::sessions::{reachable_sessions, SessionScan, SessionScanConfig};
use udscan::scan::{Connector, ResultSet, ScanControl, ScanOptions, ScanRunner};
use udscan::target::EcuTarget;
use udscan::transport::mock::{MockChannel, MockEcu};
use udscan::vecu::{EcuProfile, EcuSim, VirtualEcu};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn identifier_task(end: u32) -> IdentifierScan {
    IdentifierScan::new(IdentifierScanConfig {
        start: 0,
        end,
        write: false,
        ..Default::default()
    })
}

fn run_identifier_scan(target: &EcuTarget, end: u32) -> ResultSet {
    let runner = ScanRunner::for_target(target, UdsClientConfig::default(), ScanOptions::default());
    runner.run(&mut identifier_task(end)).unwrap()
}

#[test]
fn identifier_scan_is_deterministic_and_matches_the_profile() {
    init_logs();
    let profile = EcuProfile::seeded(3, &[1, 2, 3]);
    let expected: Vec<u16> = profile
        .supported_identifiers()
        .filter(|&did| did < 100)
        .collect();

    let server_a = VirtualEcu::bind("127.0.0.1:0", profile.clone())
        .unwrap()
        .spawn()
        .unwrap();
    let run_a = run_identifier_scan(&server_a.target(), 100);
    server_a.stop();

    let server_b = VirtualEcu::bind("127.0.0.1:0", profile)
        .unwrap()
        .spawn()
        .unwrap();
    let run_b = run_identifier_scan(&server_b.target(), 100);
    server_b.stop();

    assert_eq!(run_a.len(), 100);
    assert_eq!(readable_identifiers(&run_a), expected);

    // Byte-identical across runs with the same seed
    let strip = |set: &ResultSet| -> Vec<_> {
        set.results()
            .iter()
            .map(|r| (r.candidate.clone(), r.outcome.clone(), r.session))
            .collect()
    };
    assert_eq!(strip(&run_a), strip(&run_b));
}

#[test]
fn sessions_scan_finds_exactly_the_mandatory_sessions() {
    init_logs();
    let profile = EcuProfile::seeded(3, &[1, 2, 3]);
    let server = VirtualEcu::bind("127.0.0.1:20162", profile)
        .unwrap()
        .spawn()
        .unwrap();

    let target: EcuTarget = "tcp-lines://127.0.0.1:20162".parse().unwrap();
    let mut task = SessionScan::new(SessionScanConfig {
        depth: 2,
        ..Default::default()
    });
    let runner = ScanRunner::for_target(&target, UdsClientConfig::default(), ScanOptions::default());
    let results = runner.run(&mut task).unwrap();
    server.stop();

    assert_eq!(reachable_sessions(&results), BTreeSet::from([0x02, 0x03]));
}

#[test]
fn service_scan_recovers_the_profile_service_set() {
    let profile = EcuProfile::seeded(3, &[1, 2, 3]);
    let expected: Vec<u8> = profile.services.iter().copied().collect();

    let sim = Arc::new(Mutex::new(EcuSim::new(profile)));
    let runner = ScanRunner::new(sim_connector(sim, VecDeque::new()), ScanOptions::default());
    let results = runner
        .run(&mut ServiceScan::new(ServiceScanConfig::default()))
        .unwrap();

    assert_eq!(supported_services(&results), expected);
}

/// Connector producing mock channels over one shared simulator. Each
/// entry in `failures` makes one future connection drop after that many
/// sends; once drained, connections are stable.
fn sim_connector(sim: Arc<Mutex<EcuSim>>, failures: VecDeque<usize>) -> Connector {
    let failures = Arc::new(Mutex::new(failures));
    Box::new(move || {
        let sim = sim.clone();
        sim.lock().unwrap().on_disconnect();
        let handler = move |req: &[u8]| sim.lock().unwrap().handle(req);
        let mut channel = MockChannel::new(MockEcu::new(handler));
        if let Some(n) = failures.lock().unwrap().pop_front() {
            channel = channel.fail_after(n);
        }
        UdsClient::with_channel(Box::new(channel), UdsClientConfig::default())
    })
}

#[test]
fn interrupted_scan_resumes_without_gaps_or_duplicates() {
    init_logs();
    let profile = EcuProfile::seeded(3, &[1, 2, 3]);

    let baseline_sim = Arc::new(Mutex::new(EcuSim::new(profile.clone())));
    let baseline = ScanRunner::new(sim_connector(baseline_sim, VecDeque::new()), ScanOptions::default())
        .run(&mut identifier_task(60))
        .unwrap();

    // Drop the link mid-run, twice
    let flaky_sim = Arc::new(Mutex::new(EcuSim::new(profile)));
    let interrupted = ScanRunner::new(
        sim_connector(flaky_sim, VecDeque::from([20, 25])),
        ScanOptions::default(),
    )
    .run(&mut identifier_task(60))
    .unwrap();

    assert_eq!(baseline.len(), 60);
    assert_eq!(interrupted.len(), 60);
    let strip = |set: &ResultSet| -> Vec<_> {
        set.results()
            .iter()
            .map(|r| (r.candidate.clone(), r.outcome.clone()))
            .collect()
    };
    assert_eq!(strip(&baseline), strip(&interrupted));
}

#[test]
fn exhausted_reconnect_budget_fails_the_run() {
    let sim = Arc::new(Mutex::new(EcuSim::new(EcuProfile::seeded(3, &[1, 2, 3]))));
    // Every connection dies almost immediately
    let failures = VecDeque::from([2, 2, 2, 2, 2, 2]);
    let options = ScanOptions {
        reconnect_attempts: 2,
        ..Default::default()
    };
    let err = ScanRunner::new(sim_connector(sim, failures), options)
        .run(&mut identifier_task(60))
        .unwrap_err();
    assert!(matches!(
        err,
        udscan::DiagError::ReconnectExhausted { attempts: 2 }
    ));
}

#[test]
fn cancellation_flushes_partial_results() {
    let sim = Arc::new(Mutex::new(EcuSim::new(EcuProfile::seeded(3, &[1, 2, 3]))));
    let options = ScanOptions {
        control: ScanControl::with_timeout(Duration::from_millis(50)),
        inter_step_gap: Duration::from_millis(5),
        ..Default::default()
    };
    let results = ScanRunner::new(sim_connector(sim, VecDeque::new()), options)
        .run(&mut identifier_task(0x1000))
        .unwrap();
    assert!(results.cancelled());
    assert!(!results.is_empty());
    assert!(results.len() < 0x1000);
}
