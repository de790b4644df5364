/*!
    process image: the bytes exchanged cyclically with the slaves, accessed by variable handles.

    The image keeps two buffers, one per [Direction]:

    - outputs are staged by the application with [ProcessImage::set] and copied into the next cyclic frame
    - inputs are only written by the cyclic exchange, which publishes a complete [Snapshot] of both buffers after each cycle

    Publishing swaps an `Arc`, so readers always get a consistent snapshot and never wait on the cyclic thread for longer than a pointer copy.
*/

use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use core::time::Duration;

use crate::{
    tree::{ProcessLayout, VariableInfo, Direction},
    data,
    error::{EthercatError, EthercatResult},
    };


/// handle to a variable of the process image, produced by [ProcessImage::handles]
#[derive(Clone, Debug)]
pub struct VariableHandle {
    layout: Arc<ProcessLayout>,
    index: usize,
}
impl VariableHandle {
    pub(crate) fn new(layout: Arc<ProcessLayout>, index: usize) -> Self {
        Self {layout, index}
    }
    pub fn info(&self) -> Option<&VariableInfo>  {self.layout.variable(self.index)}
    pub fn name(&self) -> &str  {self.info().map_or("", |info| info.name.as_str())}

    /// check the handle belongs to this layout and return its placement
    fn resolve<'a>(&'a self, layout: &Arc<ProcessLayout>) -> EthercatResult<&'a VariableInfo> {
        if ! Arc::ptr_eq(&self.layout, layout)
            {return Err(EthercatError::OutOfRange("variable handle from an other process layout"))}
        self.layout.variable(self.index)
            .ok_or(EthercatError::OutOfRange("variable handle index out of layout"))
    }
}

/// complete state of the process image after one cycle
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// number of the cycle that produced this snapshot, 0 before the first exchange
    pub cycle: u64,
    /// clock time at the start of the producing cycle
    pub timestamp: Duration,
    layout: Arc<ProcessLayout>,
    outputs: Vec<u8>,
    inputs: Vec<u8>,
}
impl Snapshot {
    fn empty(layout: Arc<ProcessLayout>) -> Self {
        Self {
            cycle: 0,
            timestamp: Duration::ZERO,
            outputs: vec![0; layout.size(Direction::Output)],
            inputs: vec![0; layout.size(Direction::Input)],
            layout,
        }
    }
    /// value of a variable as exchanged in this cycle
    pub fn get(&self, handle: &VariableHandle) -> EthercatResult<u64> {
        let info = handle.resolve(&self.layout)?;
        read(self.buffer(info.direction), info)
    }
    fn buffer(&self, direction: Direction) -> &[u8] {
        match direction {
            Direction::Output => &self.outputs,
            Direction::Input => &self.inputs,
        }
    }
}

/// process image of one bus
pub struct ProcessImage {
    layout: Arc<ProcessLayout>,
    current: RwLock<Arc<Snapshot>>,
    staged: Mutex<Vec<u8>>,
}

impl ProcessImage {
    pub fn new(layout: Arc<ProcessLayout>) -> Self {
        Self {
            staged: Mutex::new(vec![0; layout.size(Direction::Output)]),
            current: RwLock::new(Arc::new(Snapshot::empty(layout.clone()))),
            layout,
        }
    }
    pub fn layout(&self) -> &Arc<ProcessLayout>  {&self.layout}

    /// handles to all variables, in layout order
    pub fn handles(&self) -> Vec<VariableHandle> {
        (0 .. self.layout.variables().len())
            .map(|index| VariableHandle::new(self.layout.clone(), index))
            .collect()
    }
    /// handle to the variable with the given name in the given slave
    pub fn handle(&self, station: u16, name: &str) -> Option<VariableHandle> {
        self.layout.lookup(station, name)
            .map(|index| VariableHandle::new(self.layout.clone(), index))
    }

    /**
        current value of a variable

        Inputs come from the last published snapshot, outputs are the values staged for the next cycle.
    */
    pub fn get(&self, handle: &VariableHandle) -> EthercatResult<u64> {
        let info = handle.resolve(&self.layout)?;
        match info.direction {
            Direction::Output => read(&self.staged.lock(), info),
            Direction::Input => read(&self.snapshot().inputs, info),
        }
    }
    /// stage an output value for the next cycle, the value is truncated to the variable's bit length
    pub fn set(&self, handle: &VariableHandle, value: u64) -> EthercatResult {
        let info = handle.resolve(&self.layout)?;
        if info.direction != Direction::Output
            {return Err(EthercatError::OutOfRange("inputs are only written by the cyclic exchange"))}
        data::write_bits(&mut self.staged.lock(), info.bit_offset(), info.bit_len, value)?;
        Ok(())
    }
    /// last published snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// copy the staged outputs to the output part of a logical frame
    pub(crate) fn write_frame(&self, frame: &mut [u8]) {
        let staged = self.staged.lock();
        let size = staged.len().min(frame.len());
        frame[.. size].copy_from_slice(&staged[.. size]);
    }
    /// publish the result of a cyclic exchange, `frame` is the whole logical frame as returned by the slaves
    pub(crate) fn publish(&self, frame: &[u8], cycle: u64, timestamp: Duration) {
        let outputs = self.layout.size(Direction::Output);
        let inputs = self.layout.logical(Direction::Input);
        let mut next = Snapshot {
            cycle,
            timestamp,
            layout: self.layout.clone(),
            outputs: vec![0; outputs],
            inputs: vec![0; self.layout.size(Direction::Input)],
        };
        if let Some(sent) = frame.get(.. outputs) {
            next.outputs.copy_from_slice(sent);
        }
        if let Some(received) = frame.get(inputs .. inputs + next.inputs.len()) {
            next.inputs.copy_from_slice(received);
        }
        *self.current.write() = Arc::new(next);
    }
}

/// a variable handle bound to its process image, for convenient access
#[derive(Clone)]
pub struct BoundVariable {
    image: Arc<ProcessImage>,
    handle: VariableHandle,
}
impl BoundVariable {
    pub fn new(image: Arc<ProcessImage>, handle: VariableHandle) -> Self {
        Self {image, handle}
    }
    pub fn handle(&self) -> &VariableHandle  {&self.handle}
    pub fn info(&self) -> Option<&VariableInfo>  {self.handle.info()}
    pub fn get(&self) -> EthercatResult<u64>  {self.image.get(&self.handle)}
    pub fn set(&self, value: u64) -> EthercatResult  {self.image.set(&self.handle, value)}
}

fn read(buffer: &[u8], info: &VariableInfo) -> EthercatResult<u64> {
    Ok(data::read_bits(buffer, info.bit_offset(), info.bit_len)?)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        tree::{self, ScanResult, Descriptors, Pdo, Variable},
        data::DataType,
        };
    use proptest::prelude::*;

    fn layout() -> Arc<ProcessLayout> {
        let store = Descriptors::new()
            .with_device(1, 1, "mixed", vec![
                Pdo::new("command", 0x1600, Direction::Output, 24)
                    .with_variable(Variable::new("enable", DataType::Bool, 0, 1))
                    .with_variable(Variable::new("mode", DataType::U8, 3, 5))
                    .with_variable(Variable::new("target", DataType::U16, 8, 13)),
                Pdo::new("feedback", 0x1a00, Direction::Input, 16)
                    .with_variable(Variable::new("position", DataType::U16, 2, 12)),
                ]);
        let root = tree::build(&ScanResult::new().with_slave(1, 1, 1, None), &store).unwrap();
        tree::assign_offsets(&root).unwrap()
    }

    #[test]
    fn neighbours_untouched() {
        let image = ProcessImage::new(layout());
        let enable = image.handle(1, "enable").unwrap();
        let mode = image.handle(1, "mode").unwrap();
        let target = image.handle(1, "target").unwrap();

        image.set(&mode, 0x1f).unwrap();
        image.set(&target, 0xffff).unwrap();
        assert_eq!(image.get(&enable).unwrap(), 0);
        assert_eq!(image.get(&mode).unwrap(), 0x1f);
        // truncated to 13 bits
        assert_eq!(image.get(&target).unwrap(), 0x1fff);
        image.set(&enable, 1).unwrap();
        image.set(&mode, 0).unwrap();
        assert_eq!(image.get(&enable).unwrap(), 1);
        assert_eq!(image.get(&target).unwrap(), 0x1fff);
    }

    #[test]
    fn foreign_handles() {
        let image = ProcessImage::new(layout());
        // same topology, but an other layout instance
        let other = ProcessImage::new(layout());
        let foreign = other.handle(1, "mode").unwrap();
        assert!(matches!(image.get(&foreign), Err(EthercatError::OutOfRange(_))));
        assert!(matches!(image.set(&foreign, 1), Err(EthercatError::OutOfRange(_))));

        let position = image.handle(1, "position").unwrap();
        assert!(matches!(image.set(&position, 1), Err(EthercatError::OutOfRange(_))));
    }

    #[test]
    fn published_snapshot() {
        let image = ProcessImage::new(layout());
        let target = image.handle(1, "target").unwrap();
        let position = image.handle(1, "position").unwrap();
        image.set(&target, 0x0abc).unwrap();

        let mut frame = vec![0; image.layout().frame_size()];
        image.write_frame(&mut frame);
        // inputs start after the 3 output bytes, position at bit 2
        frame[3] = 0b1111_1100;
        frame[4] = 0b0011_1111;
        image.publish(&frame, 1, Duration::from_millis(100));

        let snapshot = image.snapshot();
        assert_eq!(snapshot.cycle, 1);
        assert_eq!(snapshot.get(&position).unwrap(), 0xfff);
        assert_eq!(snapshot.get(&target).unwrap(), 0x0abc);
        assert_eq!(image.get(&position).unwrap(), 0xfff);
    }

    proptest! {
        #[test]
        fn bit_round_trip(offset in 0usize .. 64, len in 1usize ..= 64, value: u64, noise: u64) {
            let mut buffer = [0u8; 17];
            // surrounding bits must survive the insertion
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = (noise >> (i % 8 * 8)) as u8;
            }
            let before = buffer;
            data::write_bits(&mut buffer, offset, len, value).unwrap();
            prop_assert_eq!(data::read_bits(&buffer, offset, len).unwrap(), value & data::mask(len));
            for bit in (0 .. buffer.len()*8).filter(|bit| ! (offset .. offset+len).contains(bit)) {
                prop_assert_eq!(
                    data::read_bits(&buffer, bit, 1).unwrap(),
                    data::read_bits(&before, bit, 1).unwrap());
            }
        }
    }
}
