//! End-to-end routing through the real drivers on top of the firmware simulators.

use rust_fluidics::device::{
    PollPolicy, PortSelector, SharedDevice, Sv07Settings, Sv07Valve, Sy01bPump, Sy01bSettings,
    Sy08Pump, Sy08Settings, Syringe,
};
use rust_fluidics::error::FluidicsError;
use rust_fluidics::mixing::{MixScheduler, MixTask};
use rust_fluidics::records::SharedRecords;
use rust_fluidics::router::Router;
use rust_fluidics::sim::{SimulatedSv07, SimulatedSy01b, SimulatedSy08};
use rust_fluidics::stations::PortTable;

fn ports() -> PortTable {
    PortTable::from_pairs([("naoh", 2), ("hcl", 3), ("cell", 5), ("waste", 6), ("air", 7), ("flush", 8)])
        .unwrap()
}

fn binary_bench() -> Router<Sv07Valve<SimulatedSv07>, Sy08Pump<SimulatedSy08>> {
    let poll = PollPolicy::immediate();
    let valve = Sv07Valve::new(
        SimulatedSv07::new(0).with_busy_polls(2),
        Sv07Settings::default().with_poll(poll),
    )
    .unwrap();
    let pump = Sy08Pump::new(
        SimulatedSy08::new(0).with_busy_polls(3),
        Sy08Settings::default().with_poll(poll),
    )
    .unwrap();
    Router::new(valve, pump, ports()).unwrap()
}

#[test]
fn test_binary_bench_transfers_in_capacity_cycles() {
    let mut router = binary_bench();
    let moved = router.transfer("naoh", "cell", 12.0).unwrap();
    assert!((moved - 12.0).abs() < 1e-9);

    assert_eq!(router.valve().transport().port(), 5);
    assert_eq!(router.pump().transport().position(), 0);

    // three aspirate frames: 12000, 12000, 4800 steps
    let aspirates: Vec<u16> = router
        .pump()
        .transport()
        .requests()
        .iter()
        .filter(|f| f.opcode == 0x4D)
        .map(|f| u16::from_le_bytes(f.params))
        .collect();
    assert_eq!(aspirates, vec![12000, 12000, 4800]);
}

#[test]
fn test_binary_bench_full_clean_leaves_pump_empty() {
    let records = SharedRecords::new();
    let mut router = binary_bench().with_sink(Box::new(records.clone()));
    router.clean(2.0).unwrap();

    assert_eq!(router.pump_mut().query_position().unwrap(), 0);
    assert_eq!(router.valve().current_port(), Some(6));
    assert!(!records.is_empty());
}

#[test]
fn test_device_fault_aborts_transfer() {
    let mut router = binary_bench();
    router.pump_mut().transport_mut().inject_status(0x02);

    let err = router.transfer("naoh", "cell", 1.0).unwrap_err();
    assert!(matches!(err, FluidicsError::DeviceFault { code: 0x02, .. }));
}

#[test]
fn test_pump_valve_serves_both_roles() {
    let settings = Sy01bSettings::default()
        .with_poll(PollPolicy::immediate())
        .with_volume(5.0);
    let device = SharedDevice::new(
        Sy01bPump::new(SimulatedSy01b::new(1).with_busy_polls(1), settings).unwrap(),
    );
    let table = PortTable::from_pairs([("naoh", 2), ("cell", 5), ("waste", 6), ("air", 7)]).unwrap();
    let mut router = Router::new(device.clone(), device.clone(), table).unwrap();

    router.transfer("naoh", "cell", 7.0).unwrap();

    let (port, position) = device
        .with(|d| Ok((d.transport().port(), d.transport().position())))
        .unwrap();
    assert_eq!(port, 5);
    assert_eq!(position, 0);

    let commands = device.with(|d| Ok(d.transport().commands().to_vec())).unwrap();
    assert!(commands.iter().any(|c| c == "P12000"));
    assert!(commands.iter().any(|c| c == "D4800"));
}

#[test]
fn test_mixing_on_simulated_bench() {
    let records = SharedRecords::new();
    let mut router = binary_bench().with_sink(Box::new(records.clone()));

    let mut scheduler = MixScheduler::new();
    scheduler.submit(MixTask::new("naoh", 2.0).unwrap().with_increment(1.0).unwrap());
    scheduler.submit(MixTask::new("hcl", 1.0).unwrap());
    let total = scheduler.run_to_completion(&mut router).unwrap();

    assert!((total - 3.0).abs() < 1e-9);
    assert_eq!(router.pump().transport().position(), 0);
}
