use super::mock_bus::MockBusController;
use crate::bus::RegisterAddress;
use crate::config::OutputConfig;
use crate::device::{DeviceError, DeviceServer, DeviceServerBuilder};
use crate::lock::LockRegistry;
use crate::output::{OutputError, OutputState, StatePolicy};
use crate::state::{ChannelState, FileStateStore, PortState};
use std::sync::{mpsc, Arc};
use tempfile::{tempdir, TempDir};

fn builder(dir: &TempDir) -> DeviceServerBuilder {
    DeviceServerBuilder::configure()
        .with_locks(Arc::new(LockRegistry::new(dir.path().join("lock"))))
        .with_store(Arc::new(FileStateStore::new(dir.path().join("state"))))
}

fn output(name: &str, address: u8, channel: Option<u8>, startup: StatePolicy, shutdown: StatePolicy) -> OutputConfig {
    OutputConfig {
        startup,
        shutdown,
        ..OutputConfig::new(name, 1, address, channel)
    }
}

fn chip(address: u8) -> RegisterAddress {
    RegisterAddress::new(1, address).unwrap()
}

#[test]
fn build_requires_bus_controller() {
    let dir = tempdir().unwrap();
    assert!(matches!(builder(&dir).build(), Err(DeviceError::MissingController)));
}

#[test]
fn outputs_on_one_chip_share_a_bus() {
    let dir = tempdir().unwrap();
    let bus = MockBusController::new();
    let probe = bus.probe();
    let server = builder(&dir)
        .with_bus(bus)
        .add_output(OutputConfig::new("pump", 1, 0x20, Some(0)))
        .add_output(OutputConfig::new("fan", 1, 0x20, Some(1)))
        .add_output(OutputConfig::new("light", 1, 0x21, Some(0)))
        .build()
        .unwrap();

    assert_eq!(probe.open_count(), 2);
    assert_eq!(server.output_names(), vec!["fan", "light", "pump"]);
    assert!(server.has_output("pump"));
}

#[test]
fn set_state_by_name() {
    let dir = tempdir().unwrap();
    let bus = MockBusController::new();
    let probe = bus.probe();
    let mut server = builder(&dir)
        .with_bus(bus)
        .add_output(OutputConfig::new("pump", 1, 0x20, Some(0)))
        .add_output(OutputConfig::new("fan", 1, 0x20, Some(7)))
        .build()
        .unwrap();

    server.set_state("pump", OutputState::On).unwrap();
    server.set_state("fan", OutputState::On).unwrap();
    server.set_state("pump", OutputState::Off).unwrap();

    assert_eq!(probe.bus(&chip(0x20)).unwrap().register(), 0b0000_0001);
    assert_eq!(server.is_on("pump"), Ok(Some(false)));
    assert_eq!(server.is_on("fan"), Ok(Some(true)));
    assert_eq!(server.is_on("valve"), Err(DeviceError::NotFound("valve".to_string())));
    assert_eq!(
        server.set_state("valve", OutputState::On),
        Err(DeviceError::NotFound("valve".to_string()))
    );
}

#[test]
fn duplicate_output_is_rejected() {
    let dir = tempdir().unwrap();
    let mut server = builder(&dir)
        .with_bus(MockBusController::new())
        .add_output(OutputConfig::new("pump", 1, 0x20, Some(0)))
        .build()
        .unwrap();

    assert_eq!(
        server.register_output(&OutputConfig::new("pump", 1, 0x20, Some(1))),
        Err(DeviceError::DuplicateDevice("pump".to_string()))
    );
    assert!(matches!(
        server.register_output(&OutputConfig::new("valve", 1, 0x10, Some(1))),
        Err(DeviceError::InvalidConfig(_))
    ));

    server.remove_output("pump").unwrap();
    assert_eq!(server.remove_output("pump"), Err(DeviceError::NotFound("pump".to_string())));
}

#[test]
fn bus_open_failure_is_reported() {
    let dir = tempdir().unwrap();
    let result = builder(&dir)
        .with_bus(MockBusController::failing())
        .add_output(OutputConfig::new("pump", 1, 0x20, Some(0)))
        .build();

    assert!(matches!(result, Err(DeviceError::HardwareError(_))));
}

#[test]
fn start_and_stop_apply_policies() {
    let dir = tempdir().unwrap();
    let bus = MockBusController::new();
    let probe = bus.probe();
    let mut server = builder(&dir)
        .with_bus(bus)
        .add_output(output("pump", 0x20, Some(0), StatePolicy::ForceOn, StatePolicy::ForceOff))
        .add_output(output("fan", 0x20, Some(1), StatePolicy::Unchanged, StatePolicy::ForceOn))
        .build()
        .unwrap();

    server.start().unwrap();
    assert!(server.is_running());
    assert_eq!(probe.bus(&chip(0x20)).unwrap().register(), 0b1000_0000);
    assert_eq!(server.is_on("fan"), Ok(None));
    assert!(matches!(server.start(), Err(DeviceError::InvalidOperation(_))));

    server.stop().unwrap();
    assert!(!server.is_running());
    assert_eq!(probe.bus(&chip(0x20)).unwrap().register(), 0b0100_0000);
    assert!(matches!(server.stop(), Err(DeviceError::InvalidOperation(_))));
}

#[test]
fn one_failing_policy_does_not_block_others() {
    let dir = tempdir().unwrap();
    let bus = MockBusController::new();
    let probe = bus.probe();
    let mut server = builder(&dir)
        .with_bus(bus)
        .add_output(output("broken", 0x20, None, StatePolicy::ForceOn, StatePolicy::Unchanged))
        .add_output(output("pump", 0x20, Some(2), StatePolicy::ForceOn, StatePolicy::Unchanged))
        .build()
        .unwrap();

    match server.start() {
        Err(DeviceError::PolicyFailed(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0, "broken");
            assert!(matches!(failures[0].1, OutputError::NotConfigured(_)));
        }
        other => panic!("expected a policy failure, got {:?}", other),
    }

    assert_eq!(server.is_on("pump"), Ok(Some(true)));
    assert_eq!(probe.bus(&chip(0x20)).unwrap().register(), 0b0010_0000);
}

#[test]
fn status_reports_record_and_register() {
    let dir = tempdir().unwrap();
    let mut server: DeviceServer = builder(&dir)
        .with_bus(MockBusController::new())
        .add_output(OutputConfig::new("pump", 1, 0x20, Some(3)))
        .build()
        .unwrap();

    let status = server.status("pump").unwrap();
    assert_eq!(status.is_on, None);
    assert_eq!(status.committed, Ok(PortState::default()));
    // freshly powered chip reads all high
    assert_eq!(status.register, Ok([true; 8]));

    server.set_state("pump", OutputState::On).unwrap();
    let status = server.status("pump").unwrap();
    assert_eq!(status.channel, Some(3));
    assert_eq!(status.is_on, Some(true));
    let committed = status.committed.unwrap();
    assert_eq!(committed.channels()[3], ChannelState::High);
    assert_eq!(committed.channels()[0], ChannelState::Low);
    assert_eq!(status.register, Ok([false, false, false, true, false, false, false, false]));

    assert!(matches!(server.status("valve"), Err(DeviceError::NotFound(_))));
}

#[test]
fn shutdown_requested_during_startup_still_runs_shutdown_policies() {
    let dir = tempdir().unwrap();
    let bus = MockBusController::new();
    let probe = bus.probe();
    let server = builder(&dir)
        .with_bus(bus)
        .add_output(output("pump", 0x20, Some(0), StatePolicy::ForceOn, StatePolicy::ForceOff))
        .build()
        .unwrap();

    let (tx, rx) = mpsc::channel();
    tx.send(()).unwrap();
    crate::serve(server, rx).unwrap();

    let writes = probe.bus(&chip(0x20)).unwrap().writes();
    assert_eq!(writes, vec![(0x20, 0b1000_0000), (0x20, 0b0000_0000)]);
}
