/*!
	low level ethercat communication functions.

	It wraps an ethercat socket to build, send and receive ethercat frames containing data or commands.
*/

use parking_lot::{Mutex, MutexGuard};
use core::time::Duration;
use std::time::Instant;
use bilge::prelude::*;
use log::{debug, trace};

use crate::{
    socket::EthercatSocket,
    data::{self, Field, PduData, Storage, Cursor},
    error::{EthercatError, EthercatResult},
    };


/// maximum frame size, currently limited to the size tolerated by its header (content size coded with 11 bits)
pub const MAX_ETHERCAT_FRAME: usize = 2050;

/**
    low level ethercat communication functions, with no notion of slave.

    genericity allows to use a UDP socket, raw ethernet socket or a simulated segment, see [crate::socket] for more details.

    This struct does not do any checking of the communication states on the slaves, it is just executing the basic commands.

    The ethercat low level is all about PDUs: an ethercat frame intended for slaves is a PDU frame and PDU frames contain any number of PDU (Process Data Unit), each PDU is a command, acting on one of the 2 memories types:

   - **Physical Memory** (aka. registers)

		each slave has its own physical memory, commands for physical memory (`*P*`, `B*`) are addressing a specific slave, or combining the memory reads from all slaves

		The physical memory is divided into registers declared in [crate::registers]

	- **Logical Memory** (aka. fieldbus memory)

		this memory doesn't physically exist anywhere, but can be read/write using `L*`  commands with each slave contributing to the record according to the configuration set before.

		The logical memory is organized by the mapping set in the FMMU (Fieldbust Memory Management Unit)

	Only one frame is outstanding on the bus at any time: the socket is locked from the moment a frame is sent until its answer came back or timed out. Cyclic frames and mailbox PDUs are therefore interleaved, never overlapping.
*/
pub struct RawMaster {
    /// socket implementation, `None` once the transport has been released
	socket: Mutex<Option<Exchange>>,
	/// maximum time waiting for a frame to come back
	timeout: Duration,
}
struct Exchange {
    socket: Box<dyn EthercatSocket + Send>,
    token: u8,
    send: [u8; MAX_ETHERCAT_FRAME],
    receive: [u8; MAX_ETHERCAT_FRAME],
    frames: u64,
}

/// one PDU to exchange in a frame, its data is overwritten by the answer
pub struct Pdu<'a> {
    pub command: PduCommand,
    pub slave: u16,
    pub memory: u16,
    pub data: &'a mut [u8],
    /// working counter of the answer, this is the number of slaves who processed the command
    pub answers: u16,
}
impl<'a> Pdu<'a> {
    pub fn new(command: PduCommand, slave: u16, memory: u16, data: &'a mut [u8]) -> Self {
        Self {command, slave, memory, data, answers: 0}
    }
    /// PDU addressing the logical memory with a 32 bit address
    pub fn logical(command: PduCommand, address: u32, data: &'a mut [u8]) -> Self {
        Self::new(command, address as u16, (address >> 16) as u16, data)
    }
}

impl RawMaster {
	pub fn new<S: EthercatSocket + Send + 'static>(socket: S, timeout: Duration) -> Self {
        Self {
            socket: Mutex::new(Some(Exchange {
                socket: Box::new(socket),
                token: 0,
                send: [0; MAX_ETHERCAT_FRAME],
                receive: [0; MAX_ETHERCAT_FRAME],
                frames: 0,
                })),
            timeout,
        }
	}
	/// timeout used for every frame exchange
	pub fn timeout(&self) -> Duration  {self.timeout}

	/// release the transport, every later exchange will fail
	pub fn release(&self) {
        let mut socket = self.lock();
        if socket.take().is_some() {
            debug!("ethercat transport released");
        }
	}
	/// true if the transport has not been released
	pub fn is_open(&self) -> bool {
        self.lock().is_some()
	}
	/// number of frames successfully exchanged since start
	pub fn frames(&self) -> u64 {
        self.lock().as_ref().map(|exchange| exchange.frames).unwrap_or(0)
	}

	fn lock(&self) -> MutexGuard<'_, Option<Exchange>> {
        self.socket.lock()
	}

	// shorthands to PDU commands
	pub fn brd<T: PduData>(&self, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Broadcast, address)
	}
	pub fn bwr<T: PduData>(&self, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Broadcast, address, data)
	}

	pub fn aprd<T: PduData>(&self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::AutoIncremented(slave), address)
	}
	pub fn apwr<T: PduData>(&self, slave: u16, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::AutoIncremented(slave), address, data)
	}

	pub fn fprd<T: PduData>(&self, slave: u16, address: Field<T>) -> EthercatResult<PduAnswer<T>> {
        self.read(SlaveAddress::Fixed(slave), address)
	}
	pub fn fpwr<T: PduData>(&self, slave: u16, address: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        self.write(SlaveAddress::Fixed(slave), address, data)
	}

	/// maps to a *rd command
	pub fn read<T: PduData>(&self, slave: SlaveAddress, memory: Field<T>) -> EthercatResult<PduAnswer<T>> {
        let (command, slave) = slave.command(PduCommand::BRD, PduCommand::APRD, PduCommand::FPRD, PduCommand::LRD);
        let mut buffer = T::Packed::zeroed();
        let answers = self.pdu(command, slave, memory.byte as u16, &mut buffer.as_mut()[.. memory.len])?;
        Ok(PduAnswer {
			answers,
			value: T::unpack(buffer.as_ref())?,
			})
    }
	/// maps to a *wr command
	pub fn write<T: PduData>(&self, slave: SlaveAddress, memory: Field<T>, data: T) -> EthercatResult<PduAnswer<()>> {
        let (command, slave) = slave.command(PduCommand::BWR, PduCommand::APWR, PduCommand::FPWR, PduCommand::LWR);
        let mut buffer = T::Packed::zeroed();
        data.pack(buffer.as_mut())?;
		Ok(PduAnswer {
			answers: self.pdu(command, slave, memory.byte as u16, &mut buffer.as_mut()[.. memory.len])?,
			value: (),
			})
	}

	/// send one PDU on the ethercat bus and wait for its answer
	/// returns the number of slaves who processed the command
	pub fn pdu(&self, command: PduCommand, slave: u16, memory: u16, data: &mut [u8]) -> EthercatResult<u16> {
        let mut pdus = [Pdu::new(command, slave, memory, data)];
        self.transact(&mut pdus, self.timeout)?;
        Ok(pdus[0].answers)
	}

	/**
        send the given PDUs in one frame and wait for the frame to come back

        Every PDU gets a token reserved to this exchange, answers not matching the expected token are from former exchanges that timed out and are dropped.
        Returns [EthercatError::Timeout] if the frame did not come back in time.
	*/
	pub fn transact(&self, pdus: &mut [Pdu<'_>], timeout: Duration) -> EthercatResult {
        let mut guard = self.lock();
        let exchange = guard.as_mut()
            .ok_or(EthercatError::State("ethercat transport released"))?;

        // build frame
        let base = exchange.token;
        let size = {
            let max = MAX_ETHERCAT_FRAME.min(exchange.socket.max_frame());
            let mut frame = Cursor::new(&mut exchange.send[.. max]);
            frame.write(&[0; 2])?;
            for (i, pdu) in pdus.iter().enumerate() {
                frame.pack(&PduHeader {
                    command: pdu.command,
                    token: base.wrapping_add(i as u8),
                    slave_address: pdu.slave,
                    memory_address: pdu.memory,
                    flags: PduFlags::new(
                        u11::new(u16::try_from(pdu.data.len())
                            .ok().filter(|&len| len < 0x800)
                            .ok_or(EthercatError::Configuration("pdu data exceeds frame capacity".into()))?),
                        false,
                        i + 1 < pdus.len(),
                        ),
                    interrupt: 0,
                    })
                    .map_err(|_| EthercatError::Configuration("pdus exceed frame capacity".into()))?;
                frame.write(pdu.data)
                    .map_err(|_| EthercatError::Configuration("pdus exceed frame capacity".into()))?;
                frame.pack(&PduFooter::new(0))
                    .map_err(|_| EthercatError::Configuration("pdus exceed frame capacity".into()))?;
            }
            frame.position()
        };
        EthercatHeader::new(
            u11::new((size - EthercatHeader::packed_size()) as u16),
            EthercatType::PDU,
            ).pack(&mut exchange.send)?;
        exchange.token = base.wrapping_add(pdus.len() as u8);

        // send
        exchange.socket.send(&exchange.send[.. size])?;
        trace!("sent frame of {} pdus, token {}", pdus.len(), base);

        // receive until our frame comes back
        let deadline = Instant::now() + timeout;
        loop {
            let remain = deadline.saturating_duration_since(Instant::now());
            let Some(received) = exchange.socket.receive(&mut exchange.receive, remain)?
                else {return Err(EthercatError::Timeout("ethercat frame not returned"))};
            if Self::extract(&exchange.receive[.. received], base, pdus)? {
                exchange.frames += 1;
                return Ok(())
            }
            debug!("dropped stale ethercat frame");
            if remain.is_zero() {
                return Err(EthercatError::Timeout("ethercat frame not returned"))
            }
        }
	}

	/// copy the content of a received frame to the pending PDUs, return false if the frame is not the one expected
	fn extract(frame: &[u8], base: u8, pdus: &mut [Pdu<'_>]) -> EthercatResult<bool> {
        let mut frame = Cursor::new(frame);
        let header = frame.unpack::<EthercatHeader>()?;
        if header.ty() != EthercatType::PDU  {return Ok(false)}
        let content = frame.read(usize::from(header.len().value()))
            .map_err(|_| EthercatError::Protocol("ethercat frame shorter than its header"))?;

        let mut frame = Cursor::new(content);
        for (i, pdu) in pdus.iter_mut().enumerate() {
            let header = frame.unpack::<PduHeader>()?;
            if header.token != base.wrapping_add(i as u8) {
                if i == 0  {return Ok(false)}
                return Err(EthercatError::Protocol("pdu tokens mixed in received frame"))
            }
            let content = frame.read(usize::from(header.flags.len().value()))?;
            if content.len() != pdu.data.len()
                {return Err(EthercatError::Protocol("pdu size changed on the bus"))}
            pdu.data.copy_from_slice(content);
            pdu.answers = frame.unpack::<PduFooter>()?.working_count();
        }
        Ok(true)
	}
}


/// dynamically specifies a destination address on the ethercat loop
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlaveAddress {
	/// every slave will receive and execute
	Broadcast,
	/// address will be determined by the topology (index of the slave in the ethernet loop)
	AutoIncremented(u16),
	/// address has been set by the master previously
	Fixed(u16),
	/// the logical memory is the destination, all slaves are concerned
	Logical,
}
impl SlaveAddress {
    fn command(self, broadcast: PduCommand, auto: PduCommand, fixed: PduCommand, logical: PduCommand) -> (PduCommand, u16) {
        match self {
            Self::Broadcast => (broadcast, 0),
            Self::AutoIncremented(address) => (auto, 0u16.wrapping_sub(address)),
            Self::Fixed(address) => (fixed, address),
            Self::Logical => (logical, 0),
        }
    }
}

/// value read from the bus, together with the number of slaves who processed the command
#[derive(Clone, Debug)]
pub struct PduAnswer<T> {
	pub answers: u16,
	pub value: T,
}
impl<T> PduAnswer<T> {
    /// return the value if exactly one slave answered
    pub fn one(self) -> EthercatResult<T> {
        self.exact(1)
    }
    pub fn exact(self, n: u16) -> EthercatResult<T> {
        if self.answers != n {
            return Err(match self.answers {
                0 => EthercatError::Protocol("no slave answered the command"),
                _ => EthercatError::Protocol("unexpected number of slaves answered the command"),
            })
        }
        Ok(self.value)
    }
}


/// ethercat frame header (common to ethernet or UDP mediums) as described in ETG 1000.4 table 11
#[bitsize(16)]
#[derive(TryFromBits, DebugBits, Copy, Clone)]
pub(crate) struct EthercatHeader {
    /// length of the ethercat frame (minus 2 bytes, which is the header)
    pub len: u11,
    reserved: u1,
    /// frame type
    pub ty: EthercatType,
}
data::bilge_pdudata!(EthercatHeader, u16);

/// type of ethercat frame
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum EthercatType {
    /// process data unit, use to exchange with physical and logical memory in realtime or not
    /// the mailbox content sent to slaves shall be written to the physical memory through these
    ///
    /// See ETG.1000.4
    PDU = 0x1,

    NetworkVariable = 0x4,

    /// mailbox gateway communication, between the master and non-slave devices, allowing non-slave devices to mailbox with the slaves
    ///
    /// See ETG.8200
    Mailbox = 0x5,
}


/// header of a PDU frame, this one of the possible ethercat frames
///
/// ETG.1000.4 table 13
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct PduHeader {
    /// PDU command, specifying whether logical or physical memory is accesses, addressing type, and what read/write operation
    pub command: PduCommand,
    /// PDU task request identifier
    pub token: u8,
    /// slave address, its meaning depend on the command
    pub slave_address: u16,
    /// memory address of the data to access, which memory is accessed depend on the command
    pub memory_address: u16,
    pub flags: PduFlags,
    pub interrupt: u16,
}
impl PduData for PduHeader {
    const ID: data::DataType = data::DataType::Custom;
    type Packed = [u8; 10];

    fn pack(&self, dst: &mut [u8]) -> data::PackingResult<()> {
        let mut cursor = Cursor::new(dst);
        cursor.pack(&u8::from(self.command))?;
        cursor.pack(&self.token)?;
        cursor.pack(&self.slave_address)?;
        cursor.pack(&self.memory_address)?;
        cursor.pack(&self.flags)?;
        cursor.pack(&self.interrupt)?;
        Ok(())
    }
    fn unpack(src: &[u8]) -> data::PackingResult<Self> {
        let mut cursor = Cursor::new(src);
        Ok(Self {
            command: PduCommand::from(cursor.unpack::<u8>()?),
            token: cursor.unpack()?,
            slave_address: cursor.unpack()?,
            memory_address: cursor.unpack()?,
            flags: cursor.unpack()?,
            interrupt: cursor.unpack()?,
        })
    }
}

/// length and flags word of a [PduHeader]
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub(crate) struct PduFlags {
    /// data length following the header, excluding the footer. starting from `memory_address` in the addressed memory
    pub len: u11,
    reserved: u3,
    pub circulating: bool,
    /// true if there is an other PDU in the same PDU frame
    pub next: bool,
}
data::bilge_pdudata!(PduFlags, u16);

/// footer for PDU exchange
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone, Default)]
pub(crate) struct PduFooter {
    pub working_count: u16,
}
data::bilge_pdudata!(PduFooter, u16);

/// the possible PDU commands
#[bitsize(8)]
#[derive(FromBits, Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum PduCommand {
    /// no operation
    #[fallback]
    #[default]
    NOP = 0x0,

    /// broadcast read
    BRD = 0x07,
    /// broadcast write
    BWR = 0x08,
    /// broadcast read & write
    BRW = 0x09,

    /// auto-incremented slave read
    APRD = 0x01,
    /// auto-incremented slave write
    APWR = 0x02,
    /// auto-incremented slave read & write
    APRW = 0x03,

    /// fixed slave read
    FPRD = 0x04,
    /// fixed slave write
    FPWR = 0x05,
    /// fixed slave read & write
    FPRW = 0x06,

    /// logical memory read
    LRD = 0x0A,
    /// logical memory write
    LWR = 0x0B,
    /// logical memory read & write
    LRW = 0x0C,

    /// auto-incremented slave read multiple write
    ARMW = 0x0D,
    /// fixed slave read multiple write
    FRMW = 0x0E,
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// socket answering each frame with a fixed working counter, optionally preceded by a stale frame
    struct Echo {
        frames: Vec<Vec<u8>>,
        stale: bool,
    }
    impl EthercatSocket for Echo {
        fn send(&mut self, data: &[u8]) -> io::Result<()> {
            let mut frame = data.to_vec();
            if self.stale {
                let mut stale = frame.clone();
                // shift the token of the first pdu
                stale[3] = stale[3].wrapping_sub(1);
                self.frames.push(stale);
            }
            // working counter of the single pdu
            let end = frame.len();
            frame[end-2 ..].copy_from_slice(&1u16.to_le_bytes());
            // fill data
            for byte in &mut frame[12 .. end-2] {*byte = 0xaa}
            self.frames.push(frame);
            Ok(())
        }
        fn receive(&mut self, data: &mut [u8], _timeout: Duration) -> io::Result<Option<usize>> {
            if self.frames.is_empty()  {return Ok(None)}
            let frame = self.frames.remove(0);
            data[.. frame.len()].copy_from_slice(&frame);
            Ok(Some(frame.len()))
        }
        fn max_frame(&self) -> usize {1500}
    }

    #[test]
    fn pdu_header_layout() {
        let header = PduHeader {
            command: PduCommand::FPRD,
            token: 7,
            slave_address: 0x1001,
            memory_address: 0x0130,
            flags: PduFlags::new(u11::new(2), false, true),
            interrupt: 0,
            };
        let packed = header.packed().unwrap();
        assert_eq!(packed, [0x04, 7, 0x01, 0x10, 0x30, 0x01, 0x02, 0x80, 0, 0]);
        assert_eq!(PduHeader::unpack(&packed).unwrap(), header);
    }

    #[test]
    fn stale_frames_dropped() {
        let master = RawMaster::new(Echo {frames: Vec::new(), stale: true}, Duration::from_millis(1));
        let mut data = [0u8; 4];
        let answers = master.pdu(PduCommand::FPRD, 1, 0x10, &mut data).unwrap();
        assert_eq!(answers, 1);
        assert_eq!(data, [0xaa; 4]);
        assert_eq!(master.frames(), 1);
    }

    #[test]
    fn released_transport() {
        let master = RawMaster::new(Echo {frames: Vec::new(), stale: false}, Duration::from_millis(1));
        master.release();
        assert!(! master.is_open());
        assert!(matches!(
            master.fprd(1, crate::registers::al::status),
            Err(EthercatError::State(_)),
            ));
    }
}
