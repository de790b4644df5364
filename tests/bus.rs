//! bring-up, cyclic exchange and watchdog of a master over a simulated segment

use std::{
    sync::{Arc, Mutex, atomic::{AtomicBool, AtomicU64, Ordering}},
    time::Duration,
    };
use ethercycle::*;

const VENDOR: u32 = 0x0000_0002;
const DRIVE: u32 = 0x0000_1001;
const IO: u32 = 0x0000_2002;
const PERIOD: Duration = Duration::from_millis(1);

fn descriptors() -> Descriptors {
    Descriptors::new()
        .with_device(VENDOR, DRIVE, "drive", vec![
            Pdo::new("rxpdo", 0x1600, Direction::Output, 48)
                .with_variable(Variable::new("controlword", DataType::U16, 0, 16))
                .with_variable(Variable::new("target_velocity", DataType::I32, 16, 32)),
            Pdo::new("txpdo", 0x1a00, Direction::Input, 16)
                .with_variable(Variable::new("statusword", DataType::U16, 0, 16)),
            ])
        .with_device(VENDOR, IO, "io", vec![
            Pdo::new("outputs", 0x1600, Direction::Output, 4)
                .with_variable(Variable::new("leds", DataType::U8, 0, 4)),
            Pdo::new("inputs", 0x1a00, Direction::Input, 3)
                .with_variable(Variable::new("buttons", DataType::U8, 0, 3)),
            ])
}

fn config() -> MasterConfig {
    MasterConfig {
        cycle_frequency: 1000,
        realtime: false,
        .. MasterConfig::default()
    }
}

struct Bus {
    master: MasterHandle,
    segment: SimulatedSegment,
    clock: Arc<SimulatedClock>,
}

fn bus(scan: ScanResult, config: MasterConfig) -> Bus {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(SimulatedClock::new());
    let segment = SimulatedSegment::new(vec![SimulatedSlave::new(), SimulatedSlave::new()]);
    let master = Master::build_with_clock(&scan, &descriptors(), config, segment.clone(), clock.clone()).unwrap();
    Bus {master, segment, clock}
}

fn two_slaves() -> ScanResult {
    ScanResult::new()
        .with_slave(1, VENDOR, DRIVE, None)
        .with_slave(2, VENDOR, IO, Some(1))
}

impl Bus {
    fn cycle(&self) -> EthercatResult<Arc<Snapshot>> {
        let snapshot = self.master.update_io(self.clock.now());
        self.clock.advance(PERIOD);
        snapshot
    }
}

#[test]
fn variables_through_the_bus() {
    let bus = bus(two_slaves(), config());
    assert_eq!(bus.master.state(), MasterState::PreOp);
    assert_eq!(bus.master.slaves().unwrap(), 2);
    bus.segment.slave_at(1, |slave| assert_eq!(slave.station(), 2)).unwrap();

    bus.master.configure().unwrap();
    assert_eq!(bus.master.state(), MasterState::Op);
    assert_eq!(bus.master.variables().len(), 5);

    let velocity = bus.master.variable(1, "target_velocity").unwrap();
    let leds = bus.master.variable(2, "leds").unwrap();
    let statusword = bus.master.variable(1, "statusword").unwrap();
    let buttons = bus.master.variable(2, "buttons").unwrap();
    assert!(bus.master.variable(2, "target_velocity").is_none());

    velocity.set(1200).unwrap();
    leds.set(0b1010).unwrap();
    bus.segment.slave(1, |slave| slave.set_input(0, 16, 0x0237).unwrap()).unwrap();
    bus.segment.slave(2, |slave| slave.set_input(0, 3, 0b101).unwrap()).unwrap();
    assert!(statusword.set(1).is_err());

    let snapshot = bus.cycle().unwrap();
    bus.segment.slave(1, |slave| {
        assert_eq!(slave.output(16, 32).unwrap(), 1200);
        assert_eq!(slave.output(0, 16).unwrap(), 0);
    }).unwrap();
    bus.segment.slave(2, |slave| assert_eq!(slave.output(0, 4).unwrap(), 0b1010)).unwrap();
    assert_eq!(snapshot.get(statusword.handle()).unwrap(), 0x0237);
    assert_eq!(buttons.get().unwrap(), 0b101);
    assert_eq!(snapshot.get(velocity.handle()).unwrap(), 1200);
}

#[test]
fn hooks_in_registration_order() {
    let bus = bus(two_slaves(), config());
    let order = Arc::new(Mutex::new(Vec::new()));

    bus.master.register_hook(InitHook::settings(1, vec![
        SdoRequest::write(1, 0x6060, 0, vec![8]),
        SdoRequest::write(1, 0x6071, 0, vec![0x00, 0x02]),
        ]));
    let seen = order.clone();
    bus.master.register_hook(InitHook::custom("check mode", move |channel| {
        seen.lock().unwrap().push(channel.read(1, 0x6060, 0, 1, false)?);
        Ok(())
    }));
    bus.master.register_hook(InitHook::settings(2, vec![
        SdoRequest::write(2, 0x8000, 1, vec![1, 0, 0, 0]),
        ]));

    let report = bus.master.configure().unwrap();
    assert_eq!(report.succeeded, 3);
    assert!(report.skipped.is_empty());
    bus.segment.slave(1, |slave| assert_eq!(slave.writes(), [
        (0x6060, 0, vec![8]),
        (0x6071, 0, vec![0x00, 0x02]),
        ])).unwrap();
    bus.segment.slave(2, |slave| assert_eq!(slave.writes(), [(0x8000, 1, vec![1, 0, 0, 0])])).unwrap();
    assert_eq!(*order.lock().unwrap(), [vec![8]]);
}

#[test]
fn hook_failure_policies() {
    let bus = bus(two_slaves(), config());
    bus.master.register_hook(InitHook::settings(1, vec![SdoRequest::write(1, 0x6060, 0, vec![8])]));
    bus.master.register_hook(InitHook::settings(2, vec![SdoRequest::write(2, 0x8000, 1, vec![1])]));
    bus.segment.slave(1, |slave| slave.abort_next(0x6060, 0, SdoAbortCode::READ_ONLY, u32::MAX)).unwrap();

    // the bring-up stops at the first failing hook
    assert!(matches!(bus.master.configure(), Err(EthercatError::MailboxAbort {station: 1, ..})));
    assert_eq!(bus.master.state(), MasterState::PreOp);
    bus.segment.slave(2, |slave| assert!(slave.writes().is_empty())).unwrap();

    // hooks can run again once the slave accepts them
    bus.segment.slave(1, |slave| slave.abort_next(0x6060, 0, SdoAbortCode::READ_ONLY, 0)).unwrap();
    bus.master.configure().unwrap();
    assert_eq!(bus.master.state(), MasterState::Op);
}

#[test]
fn hook_failure_skipped() {
    let bus = bus(two_slaves(), MasterConfig {hook_policy: HookPolicy::SkipAndContinue, .. config()});
    bus.master.register_hook(InitHook::settings(1, vec![SdoRequest::write(1, 0x6060, 0, vec![8])]));
    bus.master.register_hook(InitHook::settings(2, vec![SdoRequest::write(2, 0x8000, 1, vec![1])]));
    bus.segment.slave(1, |slave| slave.abort_next(0x6060, 0, SdoAbortCode::READ_ONLY, u32::MAX)).unwrap();

    let report = bus.master.configure().unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(bus.master.state(), MasterState::Op);
    bus.segment.slave(2, |slave| assert_eq!(slave.writes().len(), 1)).unwrap();
}

#[test]
fn thousand_cycles_with_jitter() {
    let bus = bus(two_slaves(), config());
    bus.master.configure().unwrap();
    let counter = bus.master.variable(1, "controlword").unwrap();

    for cycle in 0 .. 1000u64 {
        counter.set(cycle).unwrap();
        let snapshot = bus.master.update_io(bus.clock.now()).unwrap();
        assert_eq!(snapshot.get(counter.handle()).unwrap(), cycle);
        bus.clock.advance(match cycle % 2 {
            0 => Duration::from_micros(1050),
            _ => Duration::from_micros(950),
        });
    }
    let stats = bus.master.stats();
    assert_eq!(stats.cycles, 1000);
    assert_eq!(stats.intervals(), 999);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.min, Some(Duration::from_micros(950)));
    assert_eq!(stats.max, Some(Duration::from_micros(1050)));
    let mean = stats.mean().unwrap();
    assert!(mean > Duration::from_micros(999) && mean < Duration::from_micros(1001));
    let jitter = stats.stddev().unwrap();
    assert!(jitter > Duration::from_micros(45) && jitter < Duration::from_micros(55));
    assert_eq!(bus.segment.max_in_flight(), 1);
}

#[test]
fn cyclic_thread_and_mailbox() {
    let bus = bus(two_slaves(), config());
    bus.master.configure().unwrap();
    let cycles = Arc::new(AtomicU64::new(0));
    let seen = cycles.clone();
    bus.master.start(move |snapshot| seen.store(snapshot.cycle, Ordering::SeqCst)).unwrap();
    assert!(matches!(bus.master.start(|_| {}), Err(EthercatError::State(_))));
    assert!(matches!(bus.master.update_io(bus.clock.now()), Err(EthercatError::State(_))));

    // mailbox requests interleave with the cyclic frames
    for value in 0 .. 20u8 {
        bus.master.sdo(SdoRequest::write(1, 0x6060, 0, vec![value])).unwrap();
        assert_eq!(bus.master.sdo(SdoRequest::read(1, 0x6060, 0, 1)).unwrap(), [value]);
    }
    while cycles.load(Ordering::SeqCst) < 100 {
        std::thread::sleep(Duration::from_millis(1));
    }
    bus.master.stop().unwrap();

    // stopping leaves the bus quiet but still exchanging on demand
    assert_eq!(bus.master.state(), MasterState::SafeOp);
    assert!(bus.master.stats().cycles >= 100);
    assert_eq!(bus.segment.max_in_flight(), 1);
    bus.segment.slave(1, |slave| assert_eq!(slave.state(), AlState::SafeOperational)).unwrap();
}

#[test]
fn cancellation_from_outside() {
    let bus = bus(two_slaves(), config());
    bus.master.configure().unwrap();
    bus.master.start(|_| {}).unwrap();
    while bus.master.stats().cycles < 10 {
        std::thread::sleep(Duration::from_millis(1));
    }
    bus.master.cancellation().cancel();
    bus.master.stop().unwrap();
    assert_eq!(bus.master.state(), MasterState::SafeOp);

    // the loop can be started again
    bus.master.start(|_| {}).unwrap();
    bus.master.stop().unwrap();
    bus.master.dispose().unwrap();
    assert!(bus.master.update_io(bus.clock.now()).is_err());
}

#[test]
fn threaded_loop_on_deadlines() {
    let bus = bus(two_slaves(), config());
    bus.master.configure().unwrap();
    let clock = bus.clock.clone();
    // each callback simulates some work, well within the period
    bus.master.start(move |_| clock.advance(Duration::from_micros(300))).unwrap();
    while bus.master.stats().cycles < 1000 {
        std::thread::sleep(Duration::from_millis(1));
    }
    bus.master.stop().unwrap();

    let stats = bus.master.stats();
    assert!(stats.cycles >= 1000);
    assert_eq!(stats.min, Some(PERIOD));
    assert_eq!(stats.max, Some(PERIOD));
    assert_eq!(stats.stddev(), Some(Duration::ZERO));
    assert_eq!(stats.overruns, 0);
    assert_eq!(stats.misses, 0);
}

#[test]
fn snapshots_consistent_while_cancelled() {
    let bus = bus(two_slaves(), config());
    bus.master.configure().unwrap();
    let outputs = [
        bus.master.variable(1, "controlword").unwrap(),
        bus.master.variable(1, "target_velocity").unwrap(),
        bus.master.variable(2, "leds").unwrap(),
        ];
    let handles = outputs.iter().map(|variable| variable.handle().clone()).collect::<Vec<_>>();

    // every output holds the same counter, fitting in the narrowest one
    bus.master.start(move |snapshot| {
        for variable in &outputs {
            variable.set((snapshot.cycle + 1) % 16).unwrap();
        }
    }).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let master = bus.master.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            let mut last = 0;
            let mut checked = 0u64;
            while ! done.load(Ordering::SeqCst) {
                let snapshot = master.snapshot();
                let values = handles.iter()
                    .map(|handle| snapshot.get(handle).unwrap())
                    .collect::<Vec<_>>();
                assert!(values.iter().all(|&value| value == values[0]), "torn snapshot {:?} at cycle {}", values, snapshot.cycle);
                assert!(snapshot.cycle >= last, "cycle went back from {} to {}", last, snapshot.cycle);
                last = snapshot.cycle;
                checked += 1;
            }
            checked
        })
    };

    while bus.master.stats().cycles < 200 {
        std::thread::sleep(Duration::from_millis(1));
    }
    bus.master.cancellation().cancel();
    bus.master.stop().unwrap();
    assert_eq!(bus.master.state(), MasterState::SafeOp);
    std::thread::sleep(Duration::from_millis(5));
    done.store(true, Ordering::SeqCst);
    assert!(reader.join().unwrap() > 0);

    let last = bus.master.snapshot();
    assert!(last.cycle >= 200);
    bus.segment.slave(2, |slave| assert_eq!(slave.output(0, 4).unwrap(), last.cycle % 16)).unwrap();
}

#[test]
fn watchdog_recovery() {
    let bus = bus(two_slaves(), config());
    bus.master.configure().unwrap();
    bus.cycle().unwrap();

    // the drive falls back on its own
    bus.segment.slave(1, |slave| slave.set_state(AlState::SafeOperational)).unwrap();
    for _ in 0 .. config().watchdog.misses {
        bus.cycle().unwrap();
    }
    let stats = bus.master.stats();
    assert_eq!(stats.recoveries, 1);
    assert_eq!(stats.misses, u64::from(config().watchdog.misses));
    assert_eq!(bus.master.state(), MasterState::Op);
    bus.segment.slave(1, |slave| assert_eq!(slave.state(), AlState::Operational)).unwrap();
    bus.cycle().unwrap();
    assert_eq!(bus.master.stats().misses, stats.misses);
}

#[test]
fn watchdog_fault_and_reset() {
    let bus = bus(two_slaves(), config());
    let faults = Arc::new(Mutex::new(Vec::new()));
    let reported = faults.clone();
    bus.master.on_fault(move |error| reported.lock().unwrap().push(error.clone()));
    bus.master.configure().unwrap();

    bus.segment.slave(2, |slave| slave.set_responding(false)).unwrap();
    let misses = config().watchdog.misses;
    for _ in 1 .. misses {
        bus.cycle().unwrap();
    }
    assert!(matches!(bus.cycle(), Err(EthercatError::Watchdog {station: 2, misses: m}) if m == misses));
    assert_eq!(bus.master.state(), MasterState::Fault);
    assert!(matches!(bus.cycle(), Err(EthercatError::Fault(_))));
    assert_eq!(faults.lock().unwrap().len(), 1);

    // no frame is issued while in fault
    let frames = bus.segment.frames();
    assert!(bus.cycle().is_err());
    assert_eq!(bus.segment.frames(), frames);

    bus.segment.slave_at(1, |slave| slave.set_responding(true)).unwrap();
    bus.master.reset().unwrap();
    assert_eq!(bus.master.state(), MasterState::PreOp);
    bus.master.configure().unwrap();
    bus.cycle().unwrap();
    assert_eq!(bus.master.state(), MasterState::Op);
}

#[test]
fn reset_from_fault_callback() {
    let bus = bus(two_slaves(), config());
    bus.master.configure().unwrap();
    let results = Arc::new(Mutex::new(Vec::new()));
    {
        let master = Arc::downgrade(&bus.master);
        let segment = bus.segment.clone();
        let results = results.clone();
        bus.master.on_fault(move |_| {
            let Some(master) = master.upgrade()  else {return};
            segment.slave(2, |slave| slave.set_responding(true)).unwrap();
            results.lock().unwrap().push(master.reset());
        });
    }
    bus.master.start(|_| {}).unwrap();
    bus.segment.slave(2, |slave| slave.set_responding(false)).unwrap();

    let mut waited = 0;
    while results.lock().unwrap().is_empty() {
        assert!(waited < 10_000, "no fault reported, master in {}", bus.master.state());
        std::thread::sleep(Duration::from_millis(1));
        waited += 1;
    }
    // the thread stopped on the watchdog, after the callback brought the bus back
    assert!(matches!(bus.master.stop(), Err(EthercatError::Watchdog {station: 2, ..})));
    assert_eq!(bus.master.state(), MasterState::PreOp);
    assert_eq!(results.lock().unwrap().len(), 1);
    assert!(results.lock().unwrap()[0].is_ok());
    bus.master.configure().unwrap();
    bus.cycle().unwrap();
}

#[test]
fn optional_slave_tolerated() {
    let scan = ScanResult::new()
        .with_slave(1, VENDOR, DRIVE, None)
        .with_optional(2, VENDOR, IO, Some(1));
    let bus = bus(scan, config());
    bus.master.configure().unwrap();

    bus.segment.slave(2, |slave| slave.set_responding(false)).unwrap();
    for _ in 0 .. 10 {
        bus.cycle().unwrap();
    }
    assert_eq!(bus.master.state(), MasterState::Op);
    assert_eq!(bus.master.stats().misses, 10);
    assert_eq!(bus.master.stats().recoveries, 0);
}

#[test]
fn rejected_configurations() {
    let _ = env_logger::builder().is_test(true).try_init();
    let overlapping = Descriptors::new()
        .with_device(VENDOR, DRIVE, "broken", vec![
            Pdo::new("rxpdo", 0x1600, Direction::Output, 16)
                .with_variable(Variable::new("a", DataType::U16, 0, 12))
                .with_variable(Variable::new("b", DataType::U8, 8, 8)),
            ]);
    let scan = ScanResult::new().with_slave(1, VENDOR, DRIVE, None);
    let segment = SimulatedSegment::new(vec![SimulatedSlave::new()]);
    assert!(matches!(
        Master::build_with_clock(&scan, &overlapping, config(), segment.clone(), Arc::new(SimulatedClock::new())),
        Err(EthercatError::Configuration(_)),
        ));

    // more slaves declared than present on the segment
    assert!(matches!(
        Master::build_with_clock(&two_slaves(), &descriptors(), config(), segment, Arc::new(SimulatedClock::new())),
        Err(EthercatError::Configuration(_)),
        ));

    let invalid = MasterConfig {cycle_frequency: 0, .. config()};
    assert!(matches!(
        Master::build_with_clock(&two_slaves(), &descriptors(), invalid,
            SimulatedSegment::new(Vec::new()), Arc::new(SimulatedClock::new())),
        Err(EthercatError::Configuration(_)),
        ));
}

#[cfg(target_os = "linux")]
#[test]
fn opened_from_settings() {
    let _ = env_logger::builder().is_test(true).try_init();
    // descriptions are loaded before the interface is opened
    let config = MasterConfig {esi_directory: "/nonexistent/esi".into(), .. config()};
    assert!(matches!(
        Master::open(&two_slaves(), config),
        Err(EthercatError::Configuration(_)),
        ));
}
