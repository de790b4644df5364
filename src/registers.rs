/*!
    structs and consts for the registers of a standard slave's RAM used by this master. This should be used instead of any hardcoded register value.

    The goal of this file is to gather all physical memory registers at one place, so what you see here is exactly what the master and the simulated slaves agree on.
*/

use core::fmt;
use bilge::prelude::*;
use crate::data::{self, Field};

pub mod address {
    use super::*;

    /// register of the station address, aka the fixed slave address
    /// ETG.1000.4 table 32
    pub const fixed: Field<u16> = Field::simple(0x0010);
    /// slave address alias
    /// ETG.1000.4 table 32
    pub const alias: Field<u16> = Field::simple(0x0012);
}

/// AL (Application Layer) registers are controling the communication state of a slave
pub mod al {
    use super::*;

    pub const control: Field<AlControlRequest> = Field::simple(0x0120);
    pub const status: Field<AlStatus> = Field::simple(0x0130);
    pub const error: Field<u16> = Field::simple(0x0134);
}

/// FMMU (Fieldbus Memory Management Unit) is controling the mapping (copy) for a slave's physical memory from/to logical memory
pub const fmmu: FMMU = FMMU {address: 0x0600, num: 16};

/**
    SM (Sync Managers) are used for configuring and controling two distinct things:
    - mailbox exchanges (CoE, FoE, ...)
    - pdo exchanges (copying PDO data to slave's physical memory)
*/
pub mod sync_manager {
    use super::*;

	pub const interface: SyncManager = SyncManager {address: 0x0800, num: 16};
}

/// physical memory areas where the mailbox buffers are placed by this master
pub const mailbox_buffers: [MailboxBuffer; 2] = [
    // mailbox in, written by the master
    MailboxBuffer {address: 0x1000, len: 0x80},
    // mailbox out, read by the master
    MailboxBuffer {address: 0x1080, len: 0x80},
    ];

/// physical memory areas where the process data of each slave is placed by this master
pub mod process {
    /// start of the outputs (master to slave) in physical memory
    pub const outputs: u16 = 0x1100;
    /// start of the inputs (slave to master) in physical memory
    pub const inputs: u16 = 0x1800;
    /// maximum byte size of each direction
    pub const max_len: usize = 0x700;
}

/// location of a mailbox buffer in the physical memory
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MailboxBuffer {
    pub address: u16,
    pub len: usize,
}


/**
    the current operation state on one device.

    Except [Self::Bootstrap], changing to any mode can be requested from any upper mode or from the preceding one.

    ETG.1000.6 table 9
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AlState {
    /// transitional state meaning the slave is booting up and ready for nothing yet
    Bootstrap = 3,
    /// the init mode allows to set many communication registers, like the slave address, the mailbox setup, etc.
    Init = 1,
    /// allows mailbox communication, which is mendatory to configure some slaves before realtime operations
    PreOperational = 2,
    /// realtime operations, except that outputs sent to the slaves via the mapping are not applied
    SafeOperational = 4,
    /// realtime operations running, the master has full access to the slave's effector functions
    Operational = 8,
}
impl AlState {
    /// rank of the state in the normal bring-up sequence, used to check transitions
    pub fn rank(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Bootstrap => 0,
            Self::PreOperational => 1,
            Self::SafeOperational => 2,
            Self::Operational => 3,
        }
    }
}
impl TryFrom<u8> for AlState {
    type Error = data::PackingError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Init,
            2 => Self::PreOperational,
            3 => Self::Bootstrap,
            4 => Self::SafeOperational,
            8 => Self::Operational,
            _ => return Err(data::PackingError::InvalidValue("undefined slave state")),
        })
    }
}
impl fmt::Display for AlState {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
            Self::Bootstrap => "bootstrap",
            Self::Init => "init",
            Self::PreOperational => "pre-op",
            Self::SafeOperational => "safe-op",
            Self::Operational => "op",
		})
	}
}

/// ETG.1000.6 table 9
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlControlRequest {
    /// requested state of communication, as a raw [AlState]
    pub state: u4,
    /// if true, parameter change of the [AlStatus::changed] will be reset
    pub ack: bool,
    /// request of id instead of error code in [al::error]
    pub request_id: bool,
    reserved: u2,
}
data::bilge_pdudata!(AlControlRequest, u8);

impl AlControlRequest {
    /// build a request for the given state, acknowledging former errors
    pub fn request(target: AlState) -> Self {
        let mut config = Self::default();
        config.set_state(u4::new(target as u8));
        config.set_ack(true);
        config
    }
    pub fn target(&self) -> Result<AlState, data::PackingError> {
        AlState::try_from(self.state().value())
    }
}

/// ETG.1000.6 table 12
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct AlStatus {
    /// current state of communication, as a raw [AlState]
    pub state: u4,
    /// true if the last state change failed, error code is in [al::error]
    pub error: bool,
    /// true if an id is present in [al::error] instead of an error code
    pub id: bool,
    reserved: u2,
}
data::bilge_pdudata!(AlStatus, u8);

impl AlStatus {
    pub fn current(&self) -> Result<AlState, data::PackingError> {
        AlState::try_from(self.state().value())
    }
}


/// this is not a PduData but a struct transporting the address and number of FMMU registers
/// ETG.1000.4 table 57
pub struct FMMU {
    /// address of the first entry
	pub address: u16,
	/// number of entries
	pub num: u8,
}

impl FMMU {
    /// return an entry of the FMMU, `None` if the slave has no such entry
    pub fn entry(&self, index: u8) -> Option<Field<FmmuEntry>>  {
        if index >= self.num  {return None}
        Some(Field::simple(usize::from(self.address + u16::from(index)*0x10)))
    }
}

/**
	The fieldbus memory management unit (FMMU) converts logical addresses into physical addresses. FMMUs allow one to use logical addressing for data segments that span several slave devices: one PDU addresses data within several arbitrarily distributed devices. The FMMUs support bit wise mapping.

	Each FMMU entity maps one cohesive logical address space to one cohesive physical address space.

	ETG.1000.4 table 56
*/
#[bitsize(128)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct FmmuEntry {
	/// start byte in the logical memory
	pub logical_start_byte: u32,
	/// byte size of the data, counting the partially used first and last bytes
	pub logical_len_byte: u16,
	/// offset of the start bit in the logical start byte
	pub logical_start_bit: u3,
	reserved: u5,
	/// offset of the end bit in the logical end byte
	pub logical_end_bit: u3,
	reserved: u5,

	/// start byte in the physical memory (set by the sync manager)
	pub physical_start_byte: u16,
	/// start bit in the physical start byte
	pub physical_start_bit: u3,
	reserved: u5,

	/// entity will be used for read service
	pub read: bool,
	/// entity will be used for write service
	pub write: bool,
	reserved: u6,

	/// enable this FMMU entry, so physical memory will be copied from/to logical memory on read/write
	pub enable: bool,
	reserved: u7,
	reserved: u24,
}
data::bilge_pdudata!(FmmuEntry, u128);

impl FmmuEntry {
    /// build an entry mapping `len` bits starting at logical bit `logical` to the physical byte `physical`
    pub fn bits(logical: usize, len: usize, physical: u16, write: bool) -> Option<Self> {
        if len == 0  {return None}
        let end = logical + len - 1;
        let mut entry = Self::default();
        entry.set_logical_start_byte(u32::try_from(logical / 8).ok()?);
        entry.set_logical_start_bit(u3::new((logical % 8) as u8));
        entry.set_logical_len_byte(u16::try_from(end/8 - logical/8 + 1).ok()?);
        entry.set_logical_end_bit(u3::new((end % 8) as u8));
        entry.set_physical_start_byte(physical);
        entry.set_physical_start_bit(u3::new(0));
        entry.set_read(! write);
        entry.set_write(write);
        entry.set_enable(true);
        Some(entry)
    }
    /// first logical bit mapped
    pub fn logical_bit(&self) -> usize {
        self.logical_start_byte() as usize * 8 + usize::from(self.logical_start_bit().value())
    }
    /// number of bits mapped
    pub fn bit_len(&self) -> usize {
        let bytes = usize::from(self.logical_len_byte());
        if bytes == 0  {return 0}
        (bytes - 1) * 8
            + usize::from(self.logical_end_bit().value()) + 1
            - usize::from(self.logical_start_bit().value())
    }
    /// first physical bit mapped
    pub fn physical_bit(&self) -> usize {
        usize::from(self.physical_start_byte()) * 8 + usize::from(self.physical_start_bit().value())
    }
}

/// this is not a PduData but a convenience struct transporting the addresses of a sync manager
/// ETG.1000.4 table 59
pub struct SyncManager {
    /// start address of the sync manager (address of the first channel)
    pub address: u16,
    /// number of channels
    pub num: u8,
}

impl SyncManager {
    pub const fn channel(&self, index: u8) -> Field<SyncManagerChannel> {
        Field::simple(self.address as usize + index as usize * 8)
    }
    /// return the sync manager channel reserved for mailbox in
    pub const fn mailbox_write(&self) -> Field<SyncManagerChannel>   {self.channel(0)}
    /// return the sync manager channel reserved for mailbox out
    pub const fn mailbox_read(&self) -> Field<SyncManagerChannel>   {self.channel(1)}
}

/**
    The Sync manager controls the access to the DL-user memory. Each channel defines a consistent area of the DL-user memory.

    There is two ways of data exchange between master and PDI:
    - Handshake mode (mailbox): one entity fills data in and cannot access the area until the other entity reads out the data.
    - Buffered mode: the interaction between both producer of data and consumer of data is uncorrelated – each entity expects access at any time, always providing the consumer with the newest data.

    ETG.1000.4 table 58
*/
#[bitsize(64)]
#[derive(FromBits, DebugBits, Copy, Clone, Eq, PartialEq, Default)]
pub struct SyncManagerChannel {
    /// start address in octets in the physical memory of the consistent DL-user memory area.
    pub address: u16,
    /// size in octets of the consistent DL -user memory area.
    pub length: u16,
    /// raw [SyncMode]
    pub mode: u2,
    /// raw [SyncDirection]
    pub direction: u2,

    pub ec_event: bool,
    pub dls_user_event: bool,
    pub watchdog: bool,
    reserved: u1,
    pub write_event: bool,
    pub read_event: bool,
    reserved: u1,

    /// true if there is data waiting to be read (by master or slave) in the buffer
    pub mailbox_full: bool,
    pub buffer_state: u2,
    pub read_buffer_open: bool,
    pub write_buffer_open: bool,

    /// activate this channel
    pub enable: bool,
    /// A change in this parameter indicates a repeat request. This is primarily used to repeat the last mailbox interactions.
    pub repeat: bool,
    reserved: u4,

    pub dc_event_bus: bool,
    pub dc_event_local: bool,
    pub disable_pdi: bool,
    pub repeat_ack: bool,
    reserved: u6,
}
data::bilge_pdudata!(SyncManagerChannel, u64);

impl SyncManagerChannel {
    /// channel configuration for a mailbox buffer
    pub fn mailbox(buffer: MailboxBuffer, direction: SyncDirection) -> Self {
        let mut config = Self::default();
        config.set_address(buffer.address);
        config.set_length(buffer.len as u16);
        config.set_mode(u2::new(SyncMode::Mailbox as u8));
        config.set_direction(u2::new(direction as u8));
        config.set_enable(true);
        config
    }
}

/// byte offset of the status byte in [SyncManagerChannel], the byte holding [SyncManagerChannel::mailbox_full]
pub const SYNC_STATUS_OFFSET: usize = 5;
/// bit holding [SyncManagerChannel::mailbox_full] in the status byte
pub const SYNC_STATUS_FULL: u8 = 0b1000;

/// ETG.1000.4 table 58
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncMode {
    Buffered = 0,
    Mailbox = 2,
}
/// ETG.1000.4 table 58
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncDirection {
    /// sync manager buffer is read by the master
    Read = 0,
    /// sync manager buffer is written by the master
    Write = 1,
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PduData;

    #[test]
    fn fmmu_bit_range() {
        let entry = FmmuEntry::bits(13, 20, process::inputs, false).unwrap();
        assert_eq!(entry.logical_bit(), 13);
        assert_eq!(entry.bit_len(), 20);
        assert_eq!(entry.logical_len_byte(), 3);
        assert_eq!(entry.physical_bit(), usize::from(process::inputs) * 8);
        assert!(entry.read() && ! entry.write());

        let packed = entry.packed().unwrap();
        assert_eq!(FmmuEntry::unpack(&packed).unwrap(), entry);
    }

    #[test]
    fn mailbox_full_bit() {
        let mut channel = SyncManagerChannel::mailbox(mailbox_buffers[1], SyncDirection::Read);
        channel.set_mailbox_full(true);
        let packed = channel.packed().unwrap();
        assert_eq!(packed[SYNC_STATUS_OFFSET] & SYNC_STATUS_FULL, SYNC_STATUS_FULL);
        assert_eq!(&packed[0..2], &0x1080u16.to_le_bytes());
    }

    #[test]
    fn al_request() {
        let request = AlControlRequest::request(AlState::SafeOperational);
        assert_eq!(request.packed().unwrap(), [0x14]);
        assert_eq!(request.target().unwrap(), AlState::SafeOperational);
        assert!(AlState::try_from(5).is_err());
    }
}
