use std::{
    sync::Arc,
    sync::atomic::{AtomicI64, Ordering},
    error::Error,
    };
use core::time::Duration;
use ethercycle::{
    Master, MasterConfig, MasterState,
    SimulatedSegment, SimulatedSlave,
    ScanResult, Descriptors, Pdo, Variable, Direction, DataType,
    InitHook, SdoRequest,
    };

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let descriptors = Descriptors::new()
        .with_device(0x2, 0x1001, "servodrive", vec![
            Pdo::new("rxpdo", 0x1600, Direction::Output, 48)
                .with_variable(Variable::new("controlword", DataType::U16, 0, 16))
                .with_variable(Variable::new("target_velocity", DataType::I32, 16, 32)),
            Pdo::new("txpdo", 0x1a00, Direction::Input, 16)
                .with_variable(Variable::new("statusword", DataType::U16, 0, 16)),
            ]);
    let scan = ScanResult::new()
        .with_slave(1, 0x2, 0x1001, None)
        .with_slave(2, 0x2, 0x1001, Some(1));
    let segment = SimulatedSegment::new(vec![
        SimulatedSlave::new().with_input_counter(),
        SimulatedSlave::new().with_input_counter(),
        ]);

    println!("bring up");
    let config = MasterConfig {cycle_frequency: 1000, realtime: false, .. MasterConfig::default()};
    let master = Master::build_and_start(&scan, &descriptors, config, segment.clone())?;
    for station in [1, 2] {
        // cyclic synchronous velocity
        master.register_hook(InitHook::settings(station, vec![
            SdoRequest::write(station, 0x6060, 0, vec![9]),
            ]));
    }
    let report = master.configure()?;
    println!("configured, {} hooks run", report.succeeded);

    let velocity = master.variable(1, "target_velocity").ok_or("no velocity variable")?;
    let status = master.variable(1, "statusword").ok_or("no status variable")?;
    let handle = status.handle().clone();
    let last = Arc::new(AtomicI64::new(0));
    {
        let last = last.clone();
        master.start(move |snapshot| {
            if let Ok(value) = snapshot.get(&handle) {
                last.store(value as i64, Ordering::Relaxed);
            }
            if snapshot.cycle % 200 == 0 {
                println!("cycle {}  status {:#06x}", snapshot.cycle, last.load(Ordering::Relaxed));
            }
        })?;
    }

    for step in 0 .. 10 {
        velocity.set(step * 100)?;
        std::thread::sleep(Duration::from_millis(100));
        let applied = segment.slave(1, |slave| slave.output(16, 32)).ok_or("slave lost")??;
        println!("velocity {}  applied {}  state {}", step * 100, applied, master.state());
    }

    master.stop()?;
    assert_eq!(master.state(), MasterState::SafeOp);
    println!("{}", master.stats());
    master.dispose()?;
    Ok(())
}
