//! End-to-end session behaviour against the simulated sensor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tof_core::firmware::encode_image;
use tof_core::protocol::{
    CMD_FACTORY_CALIBRATION, CMD_MEASURE, CMD_STOP, ErrorCode, IRQ_STANDARD, REG_INT_EN,
};
use tof_core::{
    AppId, CaptureMode, DeviceSession, FirmwareSource, IoMode, MemorySource, NullObserver,
    SensorTransport, SessionConfig, SimConfig, SimulatedSensor, TimingConfig, TofError,
};

fn test_config() -> SessionConfig {
    SessionConfig {
        provision_on_boot: false,
        timing: TimingConfig::for_simulation(),
        ..SessionConfig::default()
    }
}

fn image() -> Vec<u8> {
    encode_image(0x2000_0000, &[0x5A; 512], 32).into_bytes()
}

fn bring_up(
    sim: &SimulatedSensor,
    config: SessionConfig,
    source: MemorySource,
) -> DeviceSession<SimulatedSensor> {
    DeviceSession::bring_up(sim.clone(), config, Arc::new(source), Arc::new(NullObserver)).unwrap()
}

fn provisioned() -> (SimulatedSensor, DeviceSession<SimulatedSensor>) {
    let sim = SimulatedSensor::default();
    let source = MemorySource::new().with_blob("tof8801_firmware.bin", image());
    let session = bring_up(&sim, test_config(), source);
    session.switch_app(AppId::Measurement).unwrap();
    (sim, session)
}

#[test]
fn test_full_lifecycle() {
    let (sim, session) = provisioned();
    assert_eq!(session.app_id(), AppId::Measurement);
    assert!(session.firmware_loaded());
    assert_eq!(sim.peek(REG_INT_EN), IRQ_STANDARD);

    let cal = session.run_factory_calibration().unwrap();
    assert_eq!(cal.crosstalk, 1000);

    session.start(CaptureMode::MEASURE).unwrap();
    for distance in [500, 510, 520] {
        assert!(sim.push_result(distance, 63));
        session.handle_interrupt().unwrap();
    }
    let distances: Vec<u16> = session
        .drain_frames()
        .iter()
        .filter_map(|f| f.result())
        .map(|r| r.distance_mm)
        .collect();
    assert_eq!(distances, vec![500, 510, 520]);
    assert_eq!(session.distance().unwrap(), Some((520, 63)));

    session.switch_app(AppId::Bootloader).unwrap();
    assert!(!session.is_capturing());
    assert!(!sim.measuring());
    assert_eq!(sim.app_id(), AppId::Bootloader);

    session.shutdown().unwrap();
}

#[test]
fn test_switch_to_running_app_touches_nothing() {
    let (sim, session) = provisioned();
    sim.clear_log();
    session.switch_app(AppId::Measurement).unwrap();
    assert_eq!(sim.bus_ops(), 0);
}

#[test]
fn test_candidate_priority() {
    let sim = SimulatedSensor::default();
    sim.set_rom_app0(false);
    let source = Arc::new(
        MemorySource::new()
            .with_blob("A", b":020000040000FA\n:0400000001\n".to_vec())
            .with_blob("B", image())
            .with_blob("C", image()),
    );
    let mut config = test_config();
    config.firmware_candidates = vec!["A".into(), "B".into(), "C".into()];
    let session =
        DeviceSession::bring_up(sim.clone(), config, source.clone(), Arc::new(NullObserver)).unwrap();

    session.request_firmware().unwrap();
    assert_eq!(source.requests(), vec!["A", "B"]);
    assert_eq!(sim.downloads(), 1);
}

#[test]
fn test_no_candidate_leaves_bootloader() {
    let sim = SimulatedSensor::default();
    sim.set_rom_app0(false);
    let session = bring_up(&sim, test_config(), MemorySource::new());

    assert!(matches!(
        session.request_firmware(),
        Err(TofError::Firmware(_))
    ));
    assert_eq!(session.app_id(), AppId::Bootloader);
    assert!(!session.firmware_loaded());
}

#[test]
fn test_settings_change_is_stop_then_start() {
    let (sim, session) = provisioned();
    session.start(CaptureMode::MEASURE).unwrap();
    sim.clear_log();

    session.set_noise_threshold(-3).unwrap();
    assert_eq!(sim.commands(), vec![CMD_STOP, CMD_MEASURE]);
    assert_eq!(session.capture_settings().noise_threshold, -3);
}

#[test]
fn test_iteration_round_trip() {
    let (_sim, session) = provisioned();
    for value in [0, 1_000, 400_000, 65_000_000] {
        session.set_iterations(value).unwrap();
        assert_eq!(session.capture_settings().iterations(), value);
    }
    let before = session.capture_settings();
    assert!(session.set_iterations(65_536_000).is_err());
    assert!(session.set_iterations(1_500).is_err());
    assert_eq!(session.capture_settings(), before);
}

#[test]
fn test_overflow_drops_old_frames() {
    let sim = SimulatedSensor::default();
    let source = MemorySource::new().with_blob("tof8801_firmware.bin", image());
    let mut config = test_config();
    config.queue_capacity = 4;
    let session = bring_up(&sim, config, source);
    session.switch_app(AppId::Measurement).unwrap();
    session.run_factory_calibration().unwrap();
    session.start(CaptureMode::MEASURE).unwrap();

    for distance in 1..=5 {
        sim.push_result(distance, 50);
        session.handle_interrupt().unwrap();
    }

    let frames = session.drain_frames();
    assert_eq!(
        frames[0].error_report().map(|r| r.code),
        Some(ErrorCode::BufferOverflow)
    );
    let distances: Vec<u16> = frames.iter().filter_map(|f| f.result()).map(|r| r.distance_mm).collect();
    assert_eq!(distances, vec![5]);
    assert_eq!(session.queue_resets(), 1);
}

#[test]
fn test_calibration_timing() {
    let (_sim, session) = provisioned();
    let timing = session.config().timing.clone();
    let start = Instant::now();
    let result = session.run_factory_calibration().unwrap();
    assert_eq!(result.data.len(), 14);
    let bound = timing.calibration_warmup()
        + timing.calibration_poll() * 2
        + timing.calibration_settle()
        + Duration::from_millis(100);
    assert!(start.elapsed() <= bound);
}

#[test]
fn test_calibration_timeout() {
    let sim = SimulatedSensor::new(SimConfig {
        calibration_reads: None,
        ..SimConfig::default()
    });
    let source = MemorySource::new().with_blob("tof8801_firmware.bin", image());
    let session = bring_up(&sim, test_config(), source);
    session.switch_app(AppId::Measurement).unwrap();

    let timing = session.config().timing.clone();
    let start = Instant::now();
    assert!(matches!(
        session.run_factory_calibration(),
        Err(TofError::Timeout { .. })
    ));
    assert!(
        start.elapsed()
            <= timing.calibration_warmup() + timing.calibration_budget() + Duration::from_millis(100)
    );
}

/// Blocks until `cond` holds or a second has passed.
fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(1);
    while !cond() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(cond());
}

#[test]
fn test_calibration_owns_device_while_waiting() {
    let sim = SimulatedSensor::new(SimConfig {
        calibration_reads: Some(20),
        ..SimConfig::default()
    });
    let source = MemorySource::new().with_blob("tof8801_firmware.bin", image());
    let mut config = test_config();
    config.timing.calibration_budget_ms = 1000;
    let session = bring_up(&sim, config, source);
    session.switch_app(AppId::Measurement).unwrap();
    sim.clear_log();

    let calibrating = session.clone();
    let worker = thread::spawn(move || calibrating.run_factory_calibration());
    wait_until(|| sim.commands().contains(&CMD_FACTORY_CALIBRATION));

    assert!(matches!(
        session.start(CaptureMode::MEASURE),
        Err(TofError::Busy(_))
    ));
    assert!(matches!(session.set_period(50), Err(TofError::Busy(_))));
    assert!(matches!(
        session.switch_app(AppId::Bootloader),
        Err(TofError::Busy(_))
    ));
    assert!(matches!(
        session.run_factory_calibration(),
        Err(TofError::Busy(_))
    ));

    let result = worker.join().unwrap().unwrap();
    assert_eq!(result.data.len(), 14);
    assert_eq!(sim.app_id(), AppId::Measurement);
    assert!(!sim.commands()[1..].contains(&CMD_MEASURE));

    session.start(CaptureMode::MEASURE).unwrap();
    assert!(session.is_capturing());
}

/// Source that takes a while to produce each blob.
struct SlowSource {
    inner: MemorySource,
    delay: Duration,
    fetching: AtomicBool,
}

impl FirmwareSource for SlowSource {
    fn fetch(&self, name: &str) -> Option<Vec<u8>> {
        self.fetching.store(true, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.inner.fetch(name)
    }
}

#[test]
fn test_start_rejected_during_firmware_download() {
    let sim = SimulatedSensor::default();
    let source = Arc::new(SlowSource {
        inner: MemorySource::new().with_blob("tof8801_firmware.bin", image()),
        delay: Duration::from_millis(150),
        fetching: AtomicBool::new(false),
    });
    let session =
        DeviceSession::bring_up(sim.clone(), test_config(), source.clone(), Arc::new(NullObserver)).unwrap();
    session.switch_app(AppId::Measurement).unwrap();
    assert_eq!(sim.downloads(), 1);
    source.fetching.store(false, Ordering::SeqCst);

    let loader = session.clone();
    let worker = thread::spawn(move || loader.request_firmware());
    wait_until(|| source.fetching.load(Ordering::SeqCst));

    assert!(matches!(
        session.start(CaptureMode::MEASURE),
        Err(TofError::Busy(_))
    ));
    assert!(matches!(session.request_firmware(), Err(TofError::Busy(_))));

    worker.join().unwrap().unwrap();
    assert_eq!(session.app_id(), AppId::Measurement);
    assert_eq!(sim.downloads(), 2);
    assert!(!session.is_capturing());
}

#[test]
fn test_stop_after_bus_failure_quiesces_device() {
    let (sim, session) = provisioned();
    session.run_factory_calibration().unwrap();
    session.start(CaptureMode::MEASURE).unwrap();

    sim.set_failing(true);
    assert!(session.stop().is_err());
    assert!(session.is_capturing());
    sim.set_failing(false);

    session.stop().unwrap();
    assert!(!session.is_capturing());
    assert!(!sim.measuring());
}

#[test]
fn test_implausible_calibration_blocks_capture() {
    let sim = SimulatedSensor::new(SimConfig {
        calibration_blob: [0xFF, 0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        ..SimConfig::default()
    });
    let source = MemorySource::new().with_blob("tof8801_firmware.bin", image());
    let session = bring_up(&sim, test_config(), source);
    session.switch_app(AppId::Measurement).unwrap();

    let result = session.run_factory_calibration().unwrap();
    assert!(result.data.is_empty());
    assert!(matches!(
        session.start(CaptureMode::MEASURE),
        Err(TofError::Unhealthy { .. })
    ));
}

#[test]
fn test_polled_dispatch() {
    let sim = SimulatedSensor::default();
    let source = MemorySource::new().with_blob("tof8801_firmware.bin", image());
    let mut config = test_config();
    config.io_mode = IoMode::Polled { period_us: 500 };
    let session = bring_up(&sim, config, source);
    session.switch_app(AppId::Measurement).unwrap();
    session.run_factory_calibration().unwrap();

    let poller = session.start_dispatcher().unwrap().unwrap();
    session.start(CaptureMode::MEASURE).unwrap();
    sim.push_result(1500, 30);
    let frame = session.wait_frame(Duration::from_secs(1)).unwrap();
    assert_eq!(frame.result().map(|r| r.distance_mm), Some(1500));
    drop(poller);
}

#[test]
fn test_suspend_resume_after_power_loss() {
    let (sim, session) = provisioned();
    session.run_factory_calibration().unwrap();
    session.start(CaptureMode::MEASURE).unwrap();
    session.suspend().unwrap();

    session.set_chip_enabled(false).unwrap();
    sim.clear_log();
    session.with_transport(|t| t.set_chip_enable(true).unwrap());

    assert!(matches!(
        session.resume(),
        Err(TofError::WrongApplication { .. })
    ));
    let deadline = Instant::now() + Duration::from_secs(2);
    while !session.is_capturing() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(session.is_capturing());
    assert_eq!(sim.app_id(), AppId::Measurement);
}
