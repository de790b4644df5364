//! acyclic sdo access through the mailbox channel of a master in pre-operational

use std::sync::Arc;
use ethercycle::*;

const VENDOR: u32 = 0x0000_0002;
const DRIVE: u32 = 0x0000_1001;

fn master(slave: SimulatedSlave) -> (MasterHandle, SimulatedSegment) {
    let _ = env_logger::builder().is_test(true).try_init();
    let descriptors = Descriptors::new()
        .with_device(VENDOR, DRIVE, "drive", vec![
            Pdo::new("rxpdo", 0x1600, Direction::Output, 16)
                .with_variable(Variable::new("controlword", DataType::U16, 0, 16)),
            ]);
    let scan = ScanResult::new().with_slave(1, VENDOR, DRIVE, None);
    let segment = SimulatedSegment::new(vec![slave]);
    let master = Master::build_with_clock(
        &scan, &descriptors,
        MasterConfig {realtime: false, .. MasterConfig::default()},
        segment.clone(),
        Arc::new(SimulatedClock::new()),
        ).unwrap();
    assert_eq!(master.state(), MasterState::PreOp);
    (master, segment)
}

fn drive() -> SimulatedSlave {
    SimulatedSlave::new()
        .with_object(0x6060, 0, &[0])
        .with_object(0x6071, 0, &[0, 0])
        .with_object(0x1c12, 0, &[1])
        .with_object(0x1c12, 1, &[0x00, 0x16])
}

#[test]
fn expedited_settings() {
    let (master, segment) = master(drive());

    // operation mode: cyclic synchronous velocity
    master.sdo(SdoRequest::write(1, 0x6060, 0, vec![8])).unwrap();
    master.sdo_write(1, &Sdo::<u16>::sub(0x6071, 0), 0x0200).unwrap();

    segment.slave(1, |slave| {
        assert_eq!(slave.object(0x6060, 0), Some([8].as_slice()));
        assert_eq!(slave.object(0x6071, 0), Some([0x00, 0x02].as_slice()));
        assert_eq!(slave.writes().len(), 2);
    }).unwrap();
    assert_eq!(master.sdo(SdoRequest::read(1, 0x6071, 0, 2)).unwrap(), [0x00, 0x02]);
    assert_eq!(master.sdo_read(1, &Sdo::<u8>::sub(0x6060, 0)).unwrap(), 8);
    assert_eq!(master.channel().state(1), RequestState::Acked);
}

#[test]
fn segmented_transfers() {
    let (master, segment) = master(drive()
        .with_object(0x2000, 1, &[0; 300]));
    let payload = (0 .. 300).map(|i| (i * 7) as u8).collect::<Vec<u8>>();

    master.sdo(SdoRequest::write(1, 0x2000, 1, payload.clone())).unwrap();
    segment.slave(1, |slave| assert_eq!(slave.object(0x2000, 1), Some(payload.as_slice()))).unwrap();
    assert_eq!(master.sdo(SdoRequest::read(1, 0x2000, 1, 512)).unwrap(), payload);
}

#[test]
fn retried_until_answered() {
    let (master, segment) = master(drive());

    // two answers lost, the third attempt succeeds
    segment.slave(1, |slave| slave.mute_mailbox(2)).unwrap();
    assert_eq!(master.sdo(SdoRequest::read(1, 0x6060, 0, 1)).unwrap(), [0]);

    // two aborts, then accepted
    segment.slave(1, |slave| slave.abort_next(0x6060, 0, SdoAbortCode::HARDWARE_ERROR, 2)).unwrap();
    master.sdo(SdoRequest::write(1, 0x6060, 0, vec![9])).unwrap();
    segment.slave(1, |slave| assert_eq!(slave.object(0x6060, 0), Some([9].as_slice()))).unwrap();
}

#[test]
fn exhausted_retries() {
    let (master, segment) = master(drive());
    let attempts = master.config().mailbox.retries + 1;

    segment.slave(1, |slave| slave.mute_mailbox(u32::MAX)).unwrap();
    match master.sdo(SdoRequest::read(1, 0x6060, 0, 1)) {
        Err(EthercatError::MailboxTimeout {station: 1, attempts: tried, ..}) => assert_eq!(tried, attempts),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(master.channel().state(1), RequestState::TimedOut);

    segment.slave(1, |slave| {
        slave.mute_mailbox(0);
        slave.abort_next(0x6060, 0, SdoAbortCode::HARDWARE_ERROR, u32::MAX);
    }).unwrap();
    assert!(matches!(
        master.sdo(SdoRequest::write(1, 0x6060, 0, vec![3])),
        Err(EthercatError::MailboxAbort {station: 1, code: SdoAbortCode::HARDWARE_ERROR}),
        ));
    assert_eq!(master.channel().state(1), RequestState::Aborted(SdoAbortCode::HARDWARE_ERROR));

    // unknown objects are refused as well
    assert!(matches!(
        master.sdo(SdoRequest::read(1, 0x6061, 0, 1)),
        Err(EthercatError::MailboxAbort {code: SdoAbortCode::INVALID_INDEX, ..}),
        ));
}

#[test]
fn complete_access_sizes() {
    let (master, segment) = master(drive());

    // 1 byte of count and 2 bytes of entry
    master.sdo(SdoRequest::write(1, 0x1c12, 0, vec![1, 0x01, 0x16]).complete()).unwrap();
    segment.slave(1, |slave| assert_eq!(slave.object(0x1c12, 1), Some([0x01, 0x16].as_slice()))).unwrap();
    assert_eq!(master.sdo(SdoRequest::read(1, 0x1c12, 0, 8).complete()).unwrap(), [1, 0x01, 0x16]);

    // the slave refuses a payload not matching the whole object, this is not retried
    let writes = segment.slave(1, |slave| slave.writes().len()).unwrap();
    assert!(matches!(
        master.sdo(SdoRequest::write(1, 0x1c12, 0, vec![1, 0x01, 0x16, 0]).complete()),
        Err(EthercatError::SizeMismatch {received: 4, ..}),
        ));
    // a payload not matching its declared size is never sent
    assert!(matches!(
        master.sdo(SdoRequest::write(1, 0x6071, 0, vec![0x00, 0x02]).with_size(4)),
        Err(EthercatError::SizeMismatch {expected: Some(4), received: 2}),
        ));
    segment.slave(1, |slave| assert_eq!(slave.writes().len(), writes)).unwrap();
}

#[test]
fn complete_access_from_first_entry() {
    let (master, segment) = master(drive()
        .with_object(0x1c12, 2, &[0x01, 0x16]));

    // the count at subindex 0 is left out
    assert_eq!(master.sdo(SdoRequest::read(1, 0x1c12, 1, 8).complete()).unwrap(), [0x00, 0x16, 0x01, 0x16]);
    assert_eq!(master.sdo_read_bytes(1, 0x1c12, 0, 8, true).unwrap(), [2, 0x00, 0x16, 0x01, 0x16]);

    master.sdo_write_bytes(1, 0x1c12, 1, &[0x02, 0x16, 0x03, 0x16], true).unwrap();
    segment.slave(1, |slave| {
        assert_eq!(slave.object(0x1c12, 0), Some([2].as_slice()));
        assert_eq!(slave.object(0x1c12, 1), Some([0x02, 0x16].as_slice()));
        assert_eq!(slave.object(0x1c12, 2), Some([0x03, 0x16].as_slice()));
        assert_eq!(slave.writes().last(), Some(&(0x1c12, 1, vec![0x02, 0x16, 0x03, 0x16])));
    }).unwrap();

    // one entry is not the whole object from subindex 1
    assert!(matches!(
        master.sdo_write_bytes(1, 0x1c12, 1, &[0x01, 0x16], true),
        Err(EthercatError::SizeMismatch {received: 2, ..}),
        ));
}

#[test]
fn raw_bytes_round_trip() {
    let (master, segment) = master(drive());

    // operation mode: profile velocity
    master.sdo_write_bytes(1, 0x6060, 0, &[0x04], false).unwrap();
    assert_eq!(master.sdo_read_bytes(1, 0x6060, 0, 1, false).unwrap(), [0x04]);
    segment.slave(1, |slave| assert_eq!(slave.writes(), [(0x6060, 0, vec![0x04])])).unwrap();

    // the answer must fit in the requested length
    assert!(matches!(
        master.sdo_read_bytes(1, 0x6071, 0, 1, false),
        Err(EthercatError::SizeMismatch {..}),
        ));
}
