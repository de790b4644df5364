/*!
    This module maps the slaves' physical memories to the logical memory according to a [ProcessLayout], and exchanges the logical memory with the segment.

    Each slave gets at most two FMMU entries: one for its outputs and one for its inputs. They point to the process data areas of [registers::process] in the slave's physical memory, so the image bits of a slave land at the start of these areas.

    Example

    ```ignore
        let group = Group::new(raw, layout);
        // configuration of slaves, in pre-operational
        for slave in slaves {
            group.configure(station)?;
        }
        // realtime exchanges
        let answers = group.exchange(&image, &mut statuses, timeout)?;
    ```
*/

use std::sync::Arc;
use core::time::Duration;
use log::debug;

use crate::{
    rawmaster::{RawMaster, Pdu, PduCommand},
    registers::{self, FmmuEntry, AlStatus},
    tree::{ProcessLayout, Direction},
    image::ProcessImage,
    data::PduData,
    error::{EthercatError, EthercatResult},
    };


/// FMMU entries of one slave, computed from the layout
pub fn fmmu_entries(layout: &ProcessLayout, station: u16) -> EthercatResult<Vec<FmmuEntry>> {
    let mapping = layout.slave(station)
        .ok_or_else(|| EthercatError::Configuration(format!("slave {} is not in the process layout", station)))?;
    let mut entries = Vec::with_capacity(2);
    for (direction, range, physical) in [
            (Direction::Output, &mapping.outputs, registers::process::outputs),
            (Direction::Input, &mapping.inputs, registers::process::inputs),
            ] {
        let Some(range) = range  else {continue};
        let len = range.end - range.start;
        if len > registers::process::max_len * 8 {
            return Err(EthercatError::Configuration(format!(
                "slave {} maps {} bits, more than its process data area", station, len)))
        }
        let logical = layout.logical(direction) * 8 + range.start;
        let entry = FmmuEntry::bits(logical, len, physical, direction == Direction::Output)
            .ok_or_else(|| EthercatError::Configuration(format!("slave {} mapping exceeds the logical memory", station)))?;
        entries.push(entry);
    }
    Ok(entries)
}

/**
    Allows to use the contiguous slice of logical memory described by a [ProcessLayout].

    This can typically be thought as the group of all slaves of a bus, except it only manages the logical memory without any assumption on its content. Slave states are reported by the exchange but not interpreted here.
*/
pub struct Group {
    master: Arc<RawMaster>,
    layout: Arc<ProcessLayout>,
    /// logical frame: outputs followed by inputs
    buffer: Vec<u8>,
    /// expected working count of a complete exchange
    expected: u16,
}
impl Group {
    pub fn new(master: Arc<RawMaster>, layout: Arc<ProcessLayout>) -> Self {
        let expected = layout.slaves().iter()
            .map(|slave| 2 * u16::from(slave.outputs.is_some()) + u16::from(slave.inputs.is_some()))
            .sum();
        Self {
            buffer: vec![0; layout.frame_size()],
            master,
            layout,
            expected,
        }
    }
    /// working count of an exchange where all slaves processed their data
    pub fn expected(&self) -> u16  {self.expected}

    /// write the FMMU entries of a slave, then read them back to check the slave applied them
    pub fn configure(&self, station: u16) -> EthercatResult {
        let entries = fmmu_entries(&self.layout, station)?;
        for index in 0 .. registers::fmmu.num {
            let Some(field) = registers::fmmu.entry(index)  else {break};
            let entry = entries.get(usize::from(index)).copied().unwrap_or_default();
            self.master.fpwr(station, field, entry)?.one()?;
            // unused entries are only cleared
            if usize::from(index) >= entries.len()  {continue}

            let confirmed = self.master.fprd(station, field)?.one()?;
            if confirmed != entry {
                return Err(EthercatError::Configuration(format!(
                    "slave {} did not confirm its FMMU entry {}", station, index)))
            }
        }
        debug!("slave {} mapped with {} FMMU entries", station, entries.len());
        Ok(())
    }

    /**
        exchange the process image with the segment, in one frame also reading the AL status of the given slaves

        `statuses` holds a station and receives the status read, or `None` if the slave did not answer. Returns the working count of the logical exchange.
    */
    pub fn exchange(&mut self, image: &ProcessImage, statuses: &mut [(u16, Option<AlStatus>)], timeout: Duration) -> EthercatResult<u16> {
        image.write_frame(&mut self.buffer);
        let mut raw = vec![[0u8; 1]; statuses.len()];
        let logical = ! self.buffer.is_empty();
        let address = self.layout.logical(Direction::Output) as u32;

        let answers = {
            let mut pdus = Vec::with_capacity(statuses.len() + 1);
            if logical {
                pdus.push(Pdu::logical(PduCommand::LRW, address, self.buffer.as_mut_slice()));
            }
            for ((station, _), data) in statuses.iter().zip(raw.iter_mut()) {
                pdus.push(Pdu::new(
                    PduCommand::FPRD, *station,
                    registers::al::status.byte as u16,
                    data.as_mut_slice(),
                    ));
            }
            self.master.transact(&mut pdus, timeout)?;

            let (answers, physical) = match logical {
                true => (pdus[0].answers, &pdus[1 ..]),
                false => (0, pdus.as_slice()),
            };
            for ((_, status), pdu) in statuses.iter_mut().zip(physical) {
                *status = match pdu.answers {
                    1 => AlStatus::unpack(&pdu.data[..]).ok(),
                    _ => None,
                };
            }
            answers
        };
        Ok(answers)
    }
    /// the logical frame as returned by the last exchange
    pub fn frame(&self) -> &[u8]  {&self.buffer}
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tree::{self, ScanResult, Descriptors, Pdo, Variable},
        data::DataType,
        };

    #[test]
    fn entries_per_direction() {
        let store = Descriptors::new()
            .with_device(1, 1, "io", vec![
                Pdo::new("out", 0x1600, Direction::Output, 3)
                    .with_variable(Variable::new("o", DataType::U8, 0, 3)),
                Pdo::new("in", 0x1a00, Direction::Input, 16)
                    .with_variable(Variable::new("i", DataType::U16, 0, 16)),
                ])
            .with_device(1, 2, "out", vec![
                Pdo::new("out", 0x1600, Direction::Output, 7)
                    .with_variable(Variable::new("o", DataType::U8, 0, 7)),
                ]);
        let scan = ScanResult::new()
            .with_slave(1, 1, 1, None)
            .with_slave(2, 1, 2, None);
        let layout = tree::assign_offsets(&tree::build(&scan, &store).unwrap()).unwrap();

        let first = fmmu_entries(&layout, 1).unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].write());
        assert_eq!((first[0].logical_bit(), first[0].bit_len()), (0, 3));
        // inputs start after the 10 output bits rounded to 2 bytes
        assert!(first[1].read());
        assert_eq!((first[1].logical_bit(), first[1].bit_len()), (16, 16));
        assert_eq!(first[1].physical_start_byte(), registers::process::inputs);

        let second = fmmu_entries(&layout, 2).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!((second[0].logical_bit(), second[0].bit_len()), (3, 7));
        assert!(fmmu_entries(&layout, 3).is_err());

        let group = Group::new(Arc::new(RawMaster::new(
            crate::socket::SimulatedSegment::new(Vec::new()),
            Duration::from_millis(1))), layout);
        assert_eq!(group.expected(), 5);
    }
}
