//! communication with a slave's mailbox, the transport used by CoE and every other acyclic protocol

use std::sync::Arc;
use core::time::Duration;
use bilge::prelude::*;
use log::{debug, warn};

use crate::{
	rawmaster::RawMaster,
	registers::{self, SyncManagerChannel, SyncDirection},
	clock::Clock,
    data::{self, PduData, Cursor},
    error::{EthercatError, EthercatResult},
	};


/// maximum byte size of a complete mailbox frame
pub const MAILBOX_MAX_SIZE: usize = registers::mailbox_buffers[0].len;

/**
    implementation of communication with a slave's mailbox

    The mailbox is a pair of handshaked buffers in the slave's physical memory: the master writes requests in the `in` buffer and reads answers from the `out` buffer once the slave flagged it full. Mailbox access is not realtime, so polling for an answer is paced by the given [Clock] and bounded by a deadline.
*/
pub struct Mailbox {
    master: Arc<RawMaster>,
    clock: Arc<dyn Clock>,
	slave: u16,
	count: u8,
	poll: Duration,
}

impl Mailbox {
    /// configure the sync manager channels of the given slave for mailbox communication
    pub fn new(master: Arc<RawMaster>, clock: Arc<dyn Clock>, slave: u16, poll: Duration) -> EthercatResult<Self> {
        let interface = registers::sync_manager::interface;
        master.fpwr(slave, interface.mailbox_write(),
            SyncManagerChannel::mailbox(registers::mailbox_buffers[0], SyncDirection::Write))?
            .one()?;
        master.fpwr(slave, interface.mailbox_read(),
            SyncManagerChannel::mailbox(registers::mailbox_buffers[1], SyncDirection::Read))?
            .one()?;
        debug!("mailbox configured on slave {}", slave);
        Ok(Self {master, clock, slave, count: 0, poll})
    }
    /// fixed address of the slave this mailbox belongs to
    pub fn slave(&self) -> u16  {self.slave}

    /// true if the slave has put an answer in the mailbox
    pub fn poll(&mut self) -> EthercatResult<bool> {
        let state = self.master.fprd(self.slave, registers::sync_manager::interface.mailbox_read())?;
        Ok(state.answers == 1 && state.value.mailbox_full())
    }

    /// read and drop any pending answer, this is used before reusing a mailbox after a timeout
    pub fn flush(&mut self) -> EthercatResult {
        if self.poll()? {
            let mut buffer = [0; MAILBOX_MAX_SIZE];
            self.read_raw(&mut buffer)?;
            warn!("dropped late mailbox answer from slave {}", self.slave);
        }
        Ok(())
    }

	/**
        read the frame currently in the mailbox, wait for it until the deadline if not already present

        `data` is the buffer to fill with the mailbox content. The returned slice is the content of the received frame.
        Returns [EthercatError::Timeout] if nothing came before the deadline
	*/
	pub fn read<'b>(&mut self, ty: MailboxType, deadline: Duration, data: &'b mut [u8]) -> EthercatResult<&'b [u8]> {
		// wait for data
		while ! self.poll()? {
            if self.clock.now() >= deadline {
                return Err(EthercatError::Timeout("mailbox answer"))
            }
            self.clock.sleep(self.poll);
        }
        let mut buffer = [0; MAILBOX_MAX_SIZE];
        let frame = self.read_raw(&mut buffer)?;

        let mut frame = Cursor::new(frame);
        let header = frame.unpack::<MailboxHeader>()?;
        let content = frame.read(usize::from(header.length))
            .map_err(|_| EthercatError::Protocol("mailbox frame length exceeds buffer"))?;

        if header.flags.ty() == u4::from(MailboxType::Exception) {
            let error = MailboxErrorFrame::unpack(content)?;
            warn!("slave {} raised mailbox error {:?}", self.slave, error.detail());
            return Err(EthercatError::Protocol("mailbox error frame received"))
        }
        if header.flags.ty() != u4::from(ty)
            {return Err(EthercatError::Protocol("received unexpected mailbox frame type"))}
        if content.len() > data.len()
            {return Err(EthercatError::Protocol("mailbox frame exceeds receiving buffer"))}
		data[.. content.len()].copy_from_slice(content);
		Ok(&data[.. content.len()])
	}
	fn read_raw<'b>(&mut self, buffer: &'b mut [u8; MAILBOX_MAX_SIZE]) -> EthercatResult<&'b [u8]> {
        let out = registers::mailbox_buffers[1];
        let answers = self.master.pdu(
            crate::rawmaster::PduCommand::FPRD,
            self.slave,
            out.address,
            &mut buffer[.. out.len],
            )?;
        if answers != 1
            {return Err(EthercatError::Protocol("slave did not give its mailbox content"))}
        Ok(&buffer[.. out.len])
	}

	/// write the given frame in the mailbox
	pub fn write(&mut self, ty: MailboxType, priority: u2, data: &[u8]) -> EthercatResult {
        // counter rolls from 1 to 7, 0 is reserved
        self.count = (self.count % 7) + 1;
        let buffer_in = registers::mailbox_buffers[0];
        let mut buffer = [0; MAILBOX_MAX_SIZE];
		let mut frame = Cursor::new(&mut buffer[.. buffer_in.len]);
		frame.pack(&MailboxHeader {
            length: u16::try_from(data.len())
                .map_err(|_| EthercatError::Protocol("mailbox frame too big"))?,
            // address of master
            address: 0,
            flags: MailboxFlags::new(u6::new(0), priority, u4::from(ty), u3::new(self.count)),
            })?;
        frame.write(data)
            .map_err(|_| EthercatError::Protocol("data exceeds mailbox capacity"))?;

        // the whole buffer is written so the slave triggers on its last byte
        let answers = self.master.pdu(
            crate::rawmaster::PduCommand::FPWR,
            self.slave,
            buffer_in.address,
            &mut buffer[.. buffer_in.len],
            )?;
        if answers != 1
            {return Err(EthercatError::Timeout("slave did not accept mailbox frame"))}
        Ok(())
	}
}


/// ETG 1000.4 table 29
#[derive(Copy, Clone, Debug)]
pub(crate) struct MailboxHeader {
    /// length of the mailbox service data following this header
    pub length: u16,
    /**
        - if a master is client: Station Address of the source
        - if a slave is client: Station Address of the destination
    */
    pub address: u16,
    pub flags: MailboxFlags,
}
impl PduData for MailboxHeader {
    const ID: data::DataType = data::DataType::Custom;
    type Packed = [u8; 6];

    fn pack(&self, dst: &mut [u8]) -> data::PackingResult<()> {
        let mut cursor = Cursor::new(dst);
        cursor.pack(&self.length)?;
        cursor.pack(&self.address)?;
        cursor.pack(&self.flags)
    }
    fn unpack(src: &[u8]) -> data::PackingResult<Self> {
        let mut cursor = Cursor::new(src);
        Ok(Self {
            length: cursor.unpack()?,
            address: cursor.unpack()?,
            flags: cursor.unpack()?,
        })
    }
}

/// ETG 1000.4 table 29
#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub(crate) struct MailboxFlags {
    /// reserved for future
    pub channel: u6,
    /// 0 is lowest priority, 3 is highest
    pub priority: u2,
    /// raw [MailboxType]
    pub ty: u4,
    /// Counter of the mailbox services (0 reserved, this should roll from 1 to 7 and overflow to 1 after 7)
    pub count: u3,
    reserved: u1,
}
data::bilge_pdudata!(MailboxFlags, u16);

/// ETG 1000.4 table 29
#[bitsize(4)]
#[derive(FromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MailboxType {
    Exception = 0x0,
    Ads = 0x1,
    Ethernet = 0x2,
    Can = 0x3,
    File = 0x4,
    Servo = 0x5,
    #[fallback]
    Specific = 0xf,
}

/// ETG 1000.4 table 30
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub(crate) struct MailboxErrorFrame {
    pub ty: u16,
    /// raw [MailboxError]
    pub detail: u16,
}
data::bilge_pdudata!(MailboxErrorFrame, u32);

/// ETG 1000.4 table 30
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MailboxError {
    Syntax = 0x1,
    UnsupportedProtocol = 0x2,
    InvalidChannel = 0x3,
    ServiceNotSupported = 0x4,
    InvalidHeader = 0x5,
    SizeTooShort = 0x6,
    NoMoreMemory = 0x7,
    InvalidSize = 0x8,
    ServiceInWork = 0x9,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let header = MailboxHeader {
            length: 10,
            address: 0,
            flags: MailboxFlags::new(u6::new(0), u2::new(1), u4::from(MailboxType::Can), u3::new(5)),
            };
        let packed = header.packed().unwrap();
        assert_eq!(packed, [10, 0, 0, 0, 0b0100_0000, 0b0101_0011]);
        let unpacked = MailboxHeader::unpack(&packed).unwrap();
        assert_eq!(unpacked.length, 10);
        assert_eq!(unpacked.flags.count().value(), 5);
        assert_eq!(MailboxType::from(unpacked.flags.ty()), MailboxType::Can);
    }
}
