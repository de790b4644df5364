use std::{
    sync::Arc,
    error::Error,
    };
use core::time::Duration;
use ethercycle::{
    Master, MasterConfig,
    SimulatedSegment, SimulatedSlave, SimulatedClock, Clock,
    ScanResult, Descriptors, Sdo,
    };

/// device descriptions, as they would be found in the configured esi directory
const DEVICES: &str = r#"
    [[device]]
    vendor = 2
    product = 0x07d83052
    name = "EL2008 8 digital outputs"

    [[device.pdos]]
    name = "Channel outputs"
    index = 0x1600
    direction = "Output"
    bit_len = 8
    variables = [
        {name = "out_0", data_type = "Bool", bit_offset = 0, bit_len = 1},
        {name = "out_1", data_type = "Bool", bit_offset = 1, bit_len = 1},
        {name = "out_2_7", data_type = "U8", bit_offset = 2, bit_len = 6},
        ]

    [[device]]
    vendor = 2
    product = 0x03f03052
    name = "EL1008 8 digital inputs"

    [[device.pdos]]
    name = "Channel inputs"
    index = 0x1a00
    direction = "Input"
    bit_len = 8
    variables = [
        {name = "inputs", data_type = "U8", bit_offset = 0, bit_len = 8},
        ]
"#;

const CONFIG: &str = r#"
    interface = "sim"
    cycle_frequency = 500
    realtime = false

    [watchdog]
    misses = 5
"#;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = MasterConfig::from_toml(CONFIG)?;
    let descriptors = Descriptors::from_toml(DEVICES)?;
    let scan = ScanResult::new()
        .with_slave(1, 2, 0x07d83052, None)
        .with_slave(2, 2, 0x03f03052, Some(1));

    let clock = Arc::new(SimulatedClock::new());
    let segment = SimulatedSegment::new(vec![
        SimulatedSlave::new()
            .with_object(0x1008, 0, b"EL2008"),
        SimulatedSlave::new()
            .with_input_counter(),
        ]);
    let period = config.period();
    let master = Master::build_with_clock(&scan, &descriptors, config, segment.clone(), clock.clone())?;
    master.configure()?;

    let name = master.sdo_read(1, &Sdo::<[u8; 6]>::sub(0x1008, 0))?;
    println!("slave 1 is {}", String::from_utf8_lossy(&name));

    for variable in master.variables() {
        if let Some(info) = variable.info() {
            println!("slave {}  {:<10} {:?} at byte {} bit {} ({} bits)",
                info.station, info.name, info.direction, info.byte, info.bit, info.bit_len);
        }
    }

    let blink = master.variable(1, "out_0").ok_or("no out_0")?;
    let inputs = master.variable(2, "inputs").ok_or("no inputs")?;
    for cycle in 0 .. 20u64 {
        blink.set(cycle % 2)?;
        let snapshot = master.update_io(clock.now())?;
        let applied = segment.slave(1, |slave| slave.output(0, 1)).ok_or("slave lost")??;
        println!("t={:?}  cycle {}  out_0 {}  inputs {}",
            snapshot.timestamp, snapshot.cycle, applied, inputs.get()?);
        clock.advance(period);
    }
    println!("{}", master.stats());
    master.dispose()?;
    Ok(())
}
