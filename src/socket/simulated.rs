/*!
    in-memory ethercat segment, answering frames the way a chain of real slaves would.

    Each [SimulatedSlave] has a physical memory where the registers declared in [crate::registers] live. The simulation implements what this master relies on:

    - auto-incremented, fixed, broadcast and logical addressing with working counters
    - the AL state machine driven by [crate::registers::al]
    - FMMU bit mapping between the logical memory and the process data areas
    - a CoE server over the mailbox, with expedited, normal and segmented transfers and complete access

    Faults can be injected: a slave may stop answering, drop mailbox answers, or abort requests on given objects. Frames can also be lost on the way.
*/

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    io,
    };
use parking_lot::{Mutex, MutexGuard};
use core::time::Duration;
use bilge::prelude::*;
use log::{debug, trace};

use crate::{
    rawmaster::{EthercatHeader, EthercatType, PduHeader, PduCommand},
    registers::{self, AlState, AlStatus, AlControlRequest, FmmuEntry},
    mailbox::{MailboxHeader, MailboxFlags, MailboxType},
    can::{CoeHeader, CanService, SdoHeader, SdoSegmentHeader, SdoCommandRequest, SdoCommandResponse, SdoAbortCode, segment_size},
    clock::SimulatedClock,
    data::{self, PduData, Cursor},
    };
use super::EthercatSocket;


/// size of each simulated slave's physical memory
const MEMORY_SIZE: usize = 0x2000;
/// same limits as a real slave with the mailbox buffers of [registers::mailbox_buffers]
const MAILBOX_CONTENT: usize = registers::mailbox_buffers[1].len - 6;
const UPLOAD_FIRST: usize = MAILBOX_CONTENT - 2 - 4 - 4;
const SEGMENT_MAX: usize = MAILBOX_CONTENT - 2 - 1;
const SEGMENT_MIN: usize = 7;
/// AL error code raised on a refused state transition
const INVALID_STATE_CHANGE: u16 = 0x0011;


/**
    a chain of simulated slaves, usable as the socket of a master

    This is a cheap handle: clones share the same segment, so a test can keep one to inspect and control the slaves while the master owns another one.
*/
#[derive(Clone)]
pub struct SimulatedSegment {
    shared: Arc<Mutex<Segment>>,
}
struct Segment {
    slaves: Vec<SimulatedSlave>,
    pending: VecDeque<Vec<u8>>,
    clock: Option<(Arc<SimulatedClock>, Duration)>,
    lose: u32,
    frames: u64,
    exchanges: u64,
    max_in_flight: usize,
}

impl SimulatedSegment {
    /// slaves are given in their order on the ring
    pub fn new(slaves: Vec<SimulatedSlave>) -> Self {
        Self {shared: Arc::new(Mutex::new(Segment {
            slaves,
            pending: VecDeque::new(),
            clock: None,
            lose: 0,
            frames: 0,
            exchanges: 0,
            max_in_flight: 0,
        }))}
    }
    /// advance the given clock by `latency` on each frame, simulating transmission time
    pub fn with_clock(self, clock: Arc<SimulatedClock>, latency: Duration) -> Self {
        self.lock().clock = Some((clock, latency));
        self
    }
    fn lock(&self) -> MutexGuard<'_, Segment> {
        self.shared.lock()
    }

    /// run `task` on the slave with the given fixed address
    pub fn slave<R>(&self, station: u16, task: impl FnOnce(&mut SimulatedSlave) -> R) -> Option<R> {
        self.lock().slaves.iter_mut()
            .find(|slave| slave.station() == station)
            .map(task)
    }
    /// run `task` on the slave at the given position on the ring
    pub fn slave_at<R>(&self, position: usize, task: impl FnOnce(&mut SimulatedSlave) -> R) -> Option<R> {
        self.lock().slaves.get_mut(position).map(task)
    }
    /// the next `frames` frames sent will never come back
    pub fn lose_frames(&self, frames: u32) {
        self.lock().lose += frames;
    }
    /// number of frames received by the segment
    pub fn frames(&self) -> u64  {self.lock().frames}
    /// number of logical exchanges processed by the segment
    pub fn exchanges(&self) -> u64  {self.lock().exchanges}
    /// highest number of frames that were waiting on the segment at the same time
    pub fn max_in_flight(&self) -> usize  {self.lock().max_in_flight}
}

impl EthercatSocket for SimulatedSegment {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut segment = self.lock();
        segment.frames += 1;
        if let Some((clock, latency)) = &segment.clock {
            clock.advance(*latency);
        }
        if segment.lose > 0 {
            segment.lose -= 1;
            debug!("simulated segment lost a frame");
            return Ok(())
        }
        let answer = segment.process(data)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed ethercat frame"))?;
        segment.pending.push_back(answer);
        segment.max_in_flight = segment.max_in_flight.max(segment.pending.len());
        Ok(())
    }
    fn receive(&mut self, data: &mut [u8], _timeout: Duration) -> io::Result<Option<usize>> {
        let mut segment = self.lock();
        let Some(frame) = segment.pending.pop_front()
            else {return Ok(None)};
        if frame.len() > data.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "receive buffer too small"))
        }
        data[.. frame.len()].copy_from_slice(&frame);
        Ok(Some(frame.len()))
    }
    fn max_frame(&self) -> usize {1500}
}

impl Segment {
    /// pass a frame through all slaves, return the frame as it comes back to the master
    fn process(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let mut out = frame.to_vec();
        let header = EthercatHeader::unpack(&out).ok()?;
        if header.ty() != EthercatType::PDU  {return Some(out)}
        let end = 2 + usize::from(header.len().value());
        if end > out.len()  {return None}

        let mut position = 2;
        loop {
            let mut header = PduHeader::unpack(out.get(position ..)?).ok()?;
            let start = position + PduHeader::packed_size();
            let stop = start + usize::from(header.flags.len().value());
            if stop + 2 > end  {return None}

            let mut data = out[start .. stop].to_vec();
            let answers = self.pdu(&mut header, &mut data);
            let count = u16::from_le_bytes([out[stop], out[stop+1]]).wrapping_add(answers);

            header.pack(&mut out[position ..]).ok()?;
            out[start .. stop].copy_from_slice(&data);
            out[stop .. stop+2].copy_from_slice(&count.to_le_bytes());

            if ! header.flags.next()  {break}
            position = stop + 2;
        }
        Some(out)
    }

    fn pdu(&mut self, header: &mut PduHeader, data: &mut [u8]) -> u16 {
        use PduCommand::*;
        let command = header.command;
        if matches!(command, LRD | LWR | LRW) {
            self.exchanges += 1;
        }
        let exchange = self.exchanges;
        let logical = u32::from(header.slave_address) | u32::from(header.memory_address) << 16;

        let mut answers = 0;
        for slave in self.slaves.iter_mut() {
            if ! slave.responding  {continue}
            match command {
                APRD | APWR | APRW => {
                    if header.slave_address == 0 {
                        answers += slave.physical(command, header.memory_address, data);
                    }
                    header.slave_address = header.slave_address.wrapping_add(1);
                },
                FPRD | FPWR | FPRW => {
                    if slave.station() == header.slave_address {
                        answers += slave.physical(command, header.memory_address, data);
                    }
                },
                BRD | BWR | BRW => {
                    answers += slave.physical(command, header.memory_address, data);
                },
                LRD | LWR | LRW => {
                    answers += slave.logical(command, logical, data, exchange);
                },
                _ => {},
            }
        }
        trace!("simulated {:?} processed by {} slaves", command, answers);
        answers
    }
}


/// a slave of a [SimulatedSegment]
pub struct SimulatedSlave {
    memory: Vec<u8>,
    state: AlState,
    responding: bool,
    objects: BTreeMap<(u16, u8), Vec<u8>>,
    writes: Vec<(u16, u8, Vec<u8>)>,
    mute: u32,
    aborts: HashMap<(u16, u8), (SdoAbortCode, u32)>,
    input_counter: bool,
    count: u8,
    upload: Option<PendingUpload>,
    download: Option<PendingDownload>,
}
struct PendingUpload {
    data: Vec<u8>,
    toggle: bool,
}
struct PendingDownload {
    index: u16,
    sub: u8,
    complete: bool,
    total: usize,
    data: Vec<u8>,
    toggle: bool,
}

impl Default for SimulatedSlave {
    fn default() -> Self {Self::new()}
}

impl SimulatedSlave {
    pub fn new() -> Self {
        let mut new = Self {
            memory: vec![0; MEMORY_SIZE],
            state: AlState::Init,
            responding: true,
            objects: BTreeMap::new(),
            writes: Vec::new(),
            mute: 0,
            aborts: HashMap::new(),
            input_counter: false,
            count: 0,
            upload: None,
            download: None,
        };
        new.set_status(false);
        new
    }
    /// add an object to the dictionnary
    pub fn with_object(mut self, index: u16, sub: u8, value: &[u8]) -> Self {
        self.objects.insert((index, sub), value.to_vec());
        self
    }
    /// fill all the mapped inputs with the number of the current logical exchange
    pub fn with_input_counter(mut self) -> Self {
        self.input_counter = true;
        self
    }

    /// fixed address given by the master
    pub fn station(&self) -> u16 {
        u16::from_le_bytes([self.memory[0x10], self.memory[0x11]])
    }
    pub fn state(&self) -> AlState  {self.state}
    /// simulate the slave being unplugged (`false`) or back on the segment (`true`)
    pub fn set_responding(&mut self, responding: bool) {
        self.responding = responding;
    }
    /// force the slave's state, as a slave leaving its state on its own (local error, power loss)
    pub fn set_state(&mut self, state: AlState) {
        self.state = state;
        self.set_status(false);
    }
    /// drop the next `answers` mailbox answers, as if they were lost
    pub fn mute_mailbox(&mut self, answers: u32) {
        self.mute = answers;
    }
    /// refuse the next `times` requests on the given object with the given code
    pub fn abort_next(&mut self, index: u16, sub: u8, code: SdoAbortCode, times: u32) {
        self.aborts.insert((index, sub), (code, times));
    }
    /// current value of an object in the dictionnary
    pub fn object(&self, index: u16, sub: u8) -> Option<&[u8]> {
        self.objects.get(&(index, sub)).map(|value| value.as_slice())
    }
    /// every successful sdo download, in order of reception
    pub fn writes(&self) -> &[(u16, u8, Vec<u8>)] {
        &self.writes
    }
    /// set bits of the inputs area, bit offsets are relative to the slave's own inputs
    pub fn set_input(&mut self, bit: usize, len: usize, value: u64) -> data::PackingResult<()> {
        data::write_bits(&mut self.memory[usize::from(registers::process::inputs) ..], bit, len, value)
    }
    /// read bits of the outputs area, bit offsets are relative to the slave's own outputs
    pub fn output(&self, bit: usize, len: usize) -> data::PackingResult<u64> {
        data::read_bits(&self.memory[usize::from(registers::process::outputs) ..], bit, len)
    }

    fn set_status(&mut self, error: bool) {
        let mut status = AlStatus::default();
        status.set_state(u4::new(self.state as u8));
        status.set_error(error);
        let _ = registers::al::status.set(&mut self.memory, status);
    }

    /// process a command on the physical memory, return the working count increment
    fn physical(&mut self, command: PduCommand, address: u16, data: &mut [u8]) -> u16 {
        use PduCommand::*;
        let start = usize::from(address);
        let end = start + data.len();
        if end > MEMORY_SIZE  {return 0}
        let out = registers::mailbox_buffers[1];
        let input = registers::mailbox_buffers[0];
        let status = registers::al::status.byte .. registers::al::error.byte + 2;

        match command {
            APRD | FPRD | BRD => {
                if command == BRD {
                    for (dst, src) in data.iter_mut().zip(&self.memory[start .. end])  {*dst |= *src}
                }
                else {
                    data.copy_from_slice(&self.memory[start .. end]);
                }
                if start == usize::from(out.address) && data.len() >= out.len {
                    self.set_mailbox_full(false);
                }
                1
            },
            APWR | FPWR | BWR => {
                for (i, value) in data.iter().enumerate() {
                    // status registers are read-only for the master
                    if ! status.contains(&(start + i))  {self.memory[start + i] = *value}
                }
                if (start .. end).contains(&registers::al::control.byte) {
                    self.request_state();
                }
                if start == usize::from(input.address) && data.len() >= input.len {
                    self.receive_mailbox();
                }
                1
            },
            APRW | FPRW | BRW => {
                let previous = self.memory[start .. end].to_vec();
                self.memory[start .. end].copy_from_slice(data);
                data.copy_from_slice(&previous);
                3
            },
            _ => 0,
        }
    }

    /// process a command on the logical memory, return the working count increment
    fn logical(&mut self, command: PduCommand, address: u32, data: &mut [u8], exchange: u64) -> u16 {
        use PduCommand::*;
        // no process data before safe-operational
        if self.state.rank() < AlState::SafeOperational.rank()  {return 0}

        let frame_start = address as usize * 8;
        let frame_end = frame_start + data.len() * 8;
        let mut read = false;
        let mut written = false;

        for index in 0 .. registers::fmmu.num {
            let Some(field) = registers::fmmu.entry(index)  else {break};
            let Ok(entry) = field.get(&self.memory)  else {continue};
            if ! entry.enable() || entry.bit_len() == 0  {continue}

            let (logical, len, physical) = (entry.logical_bit(), entry.bit_len(), entry.physical_bit());
            let low = logical.max(frame_start);
            let high = (logical + len).min(frame_end);
            if low >= high  {continue}
            let offset = low - logical;

            if entry.read() && matches!(command, LRD | LRW) {
                if self.input_counter {
                    if let Some(bytes) = self.memory.get_mut(physical / 8 .. (physical + len + 7) / 8) {
                        bytes.fill(exchange as u8);
                    }
                }
                if data::copy_bits(&self.memory, physical + offset, data, low - frame_start, high - low).is_ok() {
                    read = true;
                }
            }
            if entry.write() && matches!(command, LWR | LRW) {
                // outputs are only applied in operational, but the slave still counts the write
                if self.state != AlState::Operational
                || data::copy_bits(data, low - frame_start, &mut self.memory, physical + offset, high - low).is_ok() {
                    written = true;
                }
            }
        }
        u16::from(read) + 2 * u16::from(written)
    }

    fn request_state(&mut self) {
        let request = registers::al::control.get(&self.memory)
            .ok()
            .and_then(|request: AlControlRequest| request.target().ok());
        match request {
            Some(target) if target.rank() <= self.state.rank() || target.rank() == self.state.rank() + 1 => {
                if target != self.state {
                    debug!("simulated slave {} switched from {} to {}", self.station(), self.state, target);
                }
                if target.rank() < AlState::PreOperational.rank() {
                    self.upload = None;
                    self.download = None;
                }
                self.state = target;
                self.set_status(false);
            },
            _ => {
                debug!("simulated slave {} refused state change from {}", self.station(), self.state);
                self.set_status(true);
                let _ = registers::al::error.set(&mut self.memory, INVALID_STATE_CHANGE);
            },
        }
    }

    fn set_mailbox_full(&mut self, full: bool) {
        let byte = registers::sync_manager::interface.mailbox_read().byte + registers::SYNC_STATUS_OFFSET;
        if full  {self.memory[byte] |= registers::SYNC_STATUS_FULL}
        else     {self.memory[byte] &= !registers::SYNC_STATUS_FULL}
    }

    fn receive_mailbox(&mut self) {
        let buffer = registers::mailbox_buffers[0];
        let start = usize::from(buffer.address);
        let request = self.memory[start .. start + buffer.len].to_vec();
        let Ok(header) = MailboxHeader::unpack(&request)  else {return};
        let Some(content) = request.get(6 .. 6 + usize::from(header.length))  else {return};
        if MailboxType::from(header.flags.ty()) != MailboxType::Can  {return}
        // mailbox access is only allowed from pre-operational
        if self.state.rank() < AlState::PreOperational.rank()  {return}

        let Some(answer) = self.coe(content)  else {return};
        if self.mute > 0 {
            self.mute -= 1;
            debug!("simulated slave {} dropped a mailbox answer", self.station());
            return
        }
        self.post(MailboxType::Can, &answer);
    }

    fn post(&mut self, ty: MailboxType, content: &[u8]) {
        self.count = (self.count % 7) + 1;
        let buffer = registers::mailbox_buffers[1];
        let start = usize::from(buffer.address);
        let place = &mut self.memory[start .. start + buffer.len];
        place.fill(0);
        let mut frame = Cursor::new(place);
        let header = MailboxHeader {
            length: content.len() as u16,
            address: 0,
            flags: MailboxFlags::new(u6::new(0), u2::new(0), u4::from(ty), u3::new(self.count)),
            };
        if frame.pack(&header).and_then(|_| frame.write(content)).is_ok() {
            self.set_mailbox_full(true);
        }
    }

    /// CoE server, return the answer to post or `None` if there is nothing to answer
    fn coe(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let mut frame = Cursor::new(request);
        let coe = frame.unpack::<CoeHeader>().ok()?;
        if ! matches!(CanService::try_from(coe.service()), Ok(CanService::SdoRequest))  {return None}
        // the command is at the same place in full and segment headers
        let command = u3::new(frame.remain().first()? >> 5);

        match SdoCommandRequest::try_from(command) {
            Ok(SdoCommandRequest::Upload) => {
                let header = frame.unpack::<SdoHeader>().ok()?;
                if let Some(code) = self.injected_abort(header.index(), header.sub())
                    {return Some(abort(header.index(), header.sub(), code))}
                Some(self.upload(header).unwrap_or_else(|code| abort(header.index(), header.sub(), code)))
            },
            Ok(SdoCommandRequest::UploadSegment) => {
                let header = frame.unpack::<SdoSegmentHeader>().ok()?;
                Some(self.upload_segment(header).unwrap_or_else(|code| abort(0, 0, code)))
            },
            Ok(SdoCommandRequest::Download) => {
                let header = frame.unpack::<SdoHeader>().ok()?;
                if let Some(code) = self.injected_abort(header.index(), header.sub())
                    {return Some(abort(header.index(), header.sub(), code))}
                Some(self.download(header, frame.remain()).unwrap_or_else(|code| abort(header.index(), header.sub(), code)))
            },
            Ok(SdoCommandRequest::DownloadSegment) => {
                let header = frame.unpack::<SdoSegmentHeader>().ok()?;
                Some(self.download_segment(header, frame.remain()).unwrap_or_else(|code| abort(0, 0, code)))
            },
            Ok(SdoCommandRequest::Abort) => {
                self.upload = None;
                self.download = None;
                None
            },
            Err(_) => Some(abort(0, 0, SdoAbortCode::UNSUPPORTED_COMMAND)),
        }
    }

    fn injected_abort(&mut self, index: u16, sub: u8) -> Option<SdoAbortCode> {
        let (code, times) = self.aborts.get_mut(&(index, sub))?;
        if *times == 0  {return None}
        *times -= 1;
        Some(*code)
    }

    fn value(&self, index: u16, sub: u8, complete: bool) -> Result<Vec<u8>, SdoAbortCode> {
        if complete {
            let entries = self.objects.range((index, sub) ..= (index, u8::MAX))
                .flat_map(|(_, value)| value.iter().copied())
                .collect::<Vec<_>>();
            if ! self.objects.keys().any(|&(i, _)| i == index)
                {return Err(SdoAbortCode::INVALID_INDEX)}
            Ok(entries)
        }
        else {
            self.objects.get(&(index, sub)).cloned().ok_or_else(|| self.missing(index))
        }
    }
    fn missing(&self, index: u16) -> SdoAbortCode {
        if self.objects.keys().any(|&(i, _)| i == index)  {SdoAbortCode::INVALID_SUBINDEX}
        else {SdoAbortCode::INVALID_INDEX}
    }
    fn store(&mut self, index: u16, sub: u8, complete: bool, data: &[u8]) -> Result<(), SdoAbortCode> {
        if complete {
            // complete access requires exactly the size of the whole object
            let sizes = self.objects.range((index, sub) ..= (index, u8::MAX))
                .map(|(&key, value)| (key, value.len()))
                .collect::<Vec<_>>();
            if sizes.is_empty()
                {return Err(self.missing(index))}
            if sizes.iter().map(|(_, size)| size).sum::<usize>() != data.len()
                {return Err(SdoAbortCode::INVALID_LENGTH)}
            let mut data = Cursor::new(data);
            for (key, size) in sizes {
                let value = data.read(size).map_err(|_| SdoAbortCode::INVALID_LENGTH)?;
                self.objects.insert(key, value.to_vec());
            }
        }
        else {
            self.objects.insert((index, sub), data.to_vec());
        }
        self.writes.push((index, sub, data.to_vec()));
        Ok(())
    }

    fn upload(&mut self, header: SdoHeader) -> Result<Vec<u8>, SdoAbortCode> {
        let value = self.value(header.index(), header.sub(), header.complete())?;
        let mut answer = Vec::with_capacity(MAILBOX_CONTENT);
        push(&mut answer, &CoeHeader::new(u9::new(0), u4::from(CanService::SdoResponse)));
        if value.len() <= 4 {
            push(&mut answer, &SdoHeader::new(
                true, true,
                u2::new((4 - value.len()) as u8),
                header.complete(),
                u3::from(SdoCommandResponse::Upload),
                header.index(), header.sub()));
            answer.extend_from_slice(&value);
            answer.resize(answer.len() + 4 - value.len(), 0);
        }
        else {
            push(&mut answer, &SdoHeader::new(
                true, false,
                u2::new(0),
                header.complete(),
                u3::from(SdoCommandResponse::Upload),
                header.index(), header.sub()));
            push(&mut answer, &(value.len() as u32));
            let first = value.len().min(UPLOAD_FIRST);
            answer.extend_from_slice(&value[.. first]);
            if first < value.len() {
                self.upload = Some(PendingUpload {data: value[first ..].to_vec(), toggle: false});
            }
        }
        Ok(answer)
    }
    fn upload_segment(&mut self, header: SdoSegmentHeader) -> Result<Vec<u8>, SdoAbortCode> {
        let pending = self.upload.as_mut().ok_or(SdoAbortCode::UNSUPPORTED_COMMAND)?;
        if header.toggle() != pending.toggle {
            self.upload = None;
            return Err(SdoAbortCode::BAD_TOGGLE)
        }
        let size = pending.data.len().min(SEGMENT_MAX);
        let content = pending.data.drain(.. size).collect::<Vec<_>>();
        let last = pending.data.is_empty();
        let toggle = pending.toggle;
        pending.toggle = ! pending.toggle;
        if last  {self.upload = None}

        let padding = SEGMENT_MIN.saturating_sub(size);
        let mut answer = Vec::with_capacity(MAILBOX_CONTENT);
        push(&mut answer, &CoeHeader::new(u9::new(0), u4::from(CanService::SdoResponse)));
        push(&mut answer, &SdoSegmentHeader::new(
            last,
            u3::new(padding as u8),
            toggle,
            u3::from(SdoCommandResponse::UploadSegment)));
        answer.extend_from_slice(&content);
        answer.resize(answer.len() + padding, 0);
        Ok(answer)
    }
    fn download(&mut self, header: SdoHeader, content: &[u8]) -> Result<Vec<u8>, SdoAbortCode> {
        if header.expedited() {
            let size = match header.sized() {
                true => 4 - usize::from(header.size().value()),
                false => 4,
            };
            let data = content.get(.. size).ok_or(SdoAbortCode::SERVICE_TOO_SMALL)?;
            self.store(header.index(), header.sub(), header.complete(), data)?;
        }
        else {
            let mut content = Cursor::new(content);
            let total = content.unpack::<u32>().map_err(|_| SdoAbortCode::SERVICE_TOO_SMALL)? as usize;
            let data = content.remain();
            if data.len() >= total {
                self.store(header.index(), header.sub(), header.complete(), &data[.. total])?;
            }
            else {
                self.download = Some(PendingDownload {
                    index: header.index(),
                    sub: header.sub(),
                    complete: header.complete(),
                    total,
                    data: data.to_vec(),
                    toggle: false,
                });
            }
        }
        let mut answer = Vec::with_capacity(10);
        push(&mut answer, &CoeHeader::new(u9::new(0), u4::from(CanService::SdoResponse)));
        push(&mut answer, &SdoHeader::new(
            false, false,
            u2::new(0),
            header.complete(),
            u3::from(SdoCommandResponse::Download),
            header.index(), header.sub()));
        answer.extend_from_slice(&[0; 4]);
        Ok(answer)
    }
    fn download_segment(&mut self, header: SdoSegmentHeader, content: &[u8]) -> Result<Vec<u8>, SdoAbortCode> {
        let pending = self.download.as_mut().ok_or(SdoAbortCode::UNSUPPORTED_COMMAND)?;
        if header.toggle() != pending.toggle {
            self.download = None;
            return Err(SdoAbortCode::BAD_TOGGLE)
        }
        let size = segment_size(&header, content);
        pending.data.extend_from_slice(&content[.. size.min(content.len())]);
        let toggle = pending.toggle;
        pending.toggle = ! pending.toggle;

        if header.last() {
            let Some(pending) = self.download.take()  else {return Err(SdoAbortCode::GENERAL_ERROR)};
            if pending.data.len() != pending.total
                {return Err(SdoAbortCode::INVALID_LENGTH)}
            self.store(pending.index, pending.sub, pending.complete, &pending.data)?;
        }
        let mut answer = Vec::with_capacity(10);
        push(&mut answer, &CoeHeader::new(u9::new(0), u4::from(CanService::SdoResponse)));
        push(&mut answer, &SdoSegmentHeader::new(
            false,
            u3::new(0),
            toggle,
            u3::from(SdoCommandResponse::DownloadSegment)));
        answer.extend_from_slice(&[0; SEGMENT_MIN]);
        Ok(answer)
    }
}

/// abort answer for the given object
fn abort(index: u16, sub: u8, code: SdoAbortCode) -> Vec<u8> {
    let mut answer = Vec::with_capacity(10);
    push(&mut answer, &CoeHeader::new(u9::new(0), u4::from(CanService::SdoRequest)));
    push(&mut answer, &SdoHeader::new(
        false, false,
        u2::new(0),
        false,
        u3::from(SdoCommandRequest::Abort),
        index, sub));
    push(&mut answer, &code.0);
    answer
}

fn push<T: PduData>(buffer: &mut Vec<u8>, value: &T) {
    if let Ok(packed) = value.packed() {
        buffer.extend_from_slice(packed.as_ref());
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::rawmaster::RawMaster;

    #[test]
    fn addressing_and_states() {
        let segment = SimulatedSegment::new(vec![SimulatedSlave::new(), SimulatedSlave::new()]);
        let master = RawMaster::new(segment.clone(), Duration::from_millis(1));

        master.apwr(1, registers::address::fixed, 0x1002).unwrap().one().unwrap();
        assert_eq!(master.fprd(0x1002, registers::address::fixed).unwrap().one().unwrap(), 0x1002);
        assert_eq!(segment.slave_at(1, |slave| slave.station()), Some(0x1002));

        // broadcast reaches both, but init cannot jump to safe-operational
        let answer = master.bwr(registers::al::control, AlControlRequest::request(AlState::SafeOperational)).unwrap();
        assert_eq!(answer.answers, 2);
        let status = master.fprd(0x1002, registers::al::status).unwrap().one().unwrap();
        assert!(status.error());
        assert_eq!(status.current().unwrap(), AlState::Init);

        master.bwr(registers::al::control, AlControlRequest::request(AlState::PreOperational)).unwrap();
        assert_eq!(segment.slave_at(0, |slave| slave.state()), Some(AlState::PreOperational));
    }

    #[test]
    fn logical_writes_counted_when_applied() {
        let segment = SimulatedSegment::new(vec![SimulatedSlave::new()]);
        let master = RawMaster::new(segment.clone(), Duration::from_millis(1));
        segment.slave_at(0, |slave| slave.set_state(AlState::Operational));
        let fmmu = registers::fmmu.entry(0).unwrap();

        // mapped past the end of the physical memory, nothing can be applied
        master.apwr(0, fmmu, FmmuEntry::bits(0, 16, (MEMORY_SIZE - 1) as u16, true).unwrap()).unwrap().one().unwrap();
        assert_eq!(master.pdu(PduCommand::LWR, 0, 0, &mut [0x12, 0x34]).unwrap(), 0);

        master.apwr(0, fmmu, FmmuEntry::bits(0, 16, registers::process::outputs, true).unwrap()).unwrap().one().unwrap();
        assert_eq!(master.pdu(PduCommand::LWR, 0, 0, &mut [0x12, 0x34]).unwrap(), 2);
        assert_eq!(segment.slave_at(0, |slave| slave.output(0, 16).unwrap()), Some(0x3412));

        // outside operational the write is counted but not applied
        segment.slave_at(0, |slave| slave.set_state(AlState::SafeOperational));
        assert_eq!(master.pdu(PduCommand::LWR, 0, 0, &mut [0, 0]).unwrap(), 2);
        assert_eq!(segment.slave_at(0, |slave| slave.output(0, 16).unwrap()), Some(0x3412));
    }

    #[test]
    fn unresponsive_slave() {
        let segment = SimulatedSegment::new(vec![SimulatedSlave::new()]);
        let master = RawMaster::new(segment.clone(), Duration::from_millis(1));
        segment.slave_at(0, |slave| slave.set_responding(false));
        assert_eq!(master.brd(registers::al::status).unwrap().answers, 0);

        segment.lose_frames(1);
        assert!(master.brd(registers::al::status).is_err());
        assert_eq!(master.brd(registers::al::status).unwrap().answers, 0);
        assert_eq!(segment.max_in_flight(), 1);
    }
}
