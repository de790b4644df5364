//! implementation of CoE (Canopen Over Ethercat)

use core::{fmt, time::Duration};
use bilge::prelude::*;
use log::{trace, warn};

use crate::{
	mailbox::{Mailbox, MailboxType, MAILBOX_MAX_SIZE},
	sdo::Sdo,
	data::{self, PduData, Storage, Cursor},
	error::{EthercatError, EthercatResult},
	};


/// maximum byte size of the content of a mailbox frame
const MAILBOX_CONTENT_MAX_SIZE: usize = MAILBOX_MAX_SIZE - 6;
/// maximum byte size of sdo data that can be expedited
const EXPEDITED_MAX_SIZE: usize = 4;
/// maximum byte size of an sdo data that can be put in a sdo request, after its total size
const SDO_REQUEST_MAX_SIZE: usize = MAILBOX_CONTENT_MAX_SIZE
                                        - <CoeHeader as PduData>::Packed::LEN
                                        - <SdoHeader as PduData>::Packed::LEN
                                        - <u32 as PduData>::Packed::LEN;
/// maximum byte size of an sdo data that can be put in a sdo segment
/// it is constrained by the mailbox buffer size on the slave
const SDO_SEGMENT_MAX_SIZE: usize = MAILBOX_CONTENT_MAX_SIZE
                                        - <CoeHeader as PduData>::Packed::LEN
                                        - <SdoSegmentHeader as PduData>::Packed::LEN;
/// minimum data size of a segment, shorter data is padded and its size is given in the segment header
const SDO_SEGMENT_MIN_SIZE: usize = 7;

/**
    implementation of CoE (Canopen Over Ethercat) SDO transfers

    It works exactly as in a Can bus, except each of its frame is encapsulated in an ethercat mailbox frame, and PDOs access is therefore not realtime.

    Each method performs exactly one attempt of the transfer and gives up at the given deadline. Retrying is the business of [crate::channel::MailboxChannel].

    Transfers are chosen according to the data size:
    - up to 4 bytes, the data is expedited in the request itself
    - above, the first bytes go with the request and the rest is sent in segments, each acknowledged by the slave
*/
pub struct Can {
    mailbox: Mailbox,
}
impl Can {
    pub fn new(mailbox: Mailbox) -> Can {
        Can {mailbox}
    }
    /// fixed address of the slave
    pub fn slave(&self) -> u16  {self.mailbox.slave()}

    /// drop any answer left in the mailbox by a former attempt
    pub fn flush(&mut self) -> EthercatResult {
        self.mailbox.flush()
    }

    /// read an SDO, any size
    pub fn sdo_read<T: PduData>(&mut self, sdo: &Sdo<T>, deadline: Duration) -> EthercatResult<T> {
		let mut data = T::Packed::zeroed();
        let received = self.sdo_read_slice(&sdo.downcast(), deadline, data.as_mut())?.len();
        if received != T::Packed::LEN
            {return Err(EthercatError::SizeMismatch {expected: Some(T::Packed::LEN), received})}
        Ok(T::unpack(data.as_ref())?)
    }

    /// read an SDO into the given buffer, return the part of the buffer filled
	pub fn sdo_read_slice<'b>(&mut self, sdo: &Sdo, deadline: Duration, data: &'b mut [u8]) -> EthercatResult<&'b mut [u8]>   {
        let mut buffer = [0; MAILBOX_MAX_SIZE];

        // generic request
        {
            let mut frame = Cursor::new(buffer.as_mut_slice());
            frame.pack(&CoeHeader::new(u9::new(0), u4::from(CanService::SdoRequest)))?;
            frame.pack(&SdoHeader::new(
                    false,
                    false,
                    u2::new(0),
                    sdo.sub.is_complete(),
                    u3::from(SdoCommandRequest::Upload),
                    sdo.index,
                    sdo.sub.unwrap(),
                ))?;
            frame.write(&[0; 4])?;
            self.mailbox.write(MailboxType::Can, u2::new(0), frame.finish())?;
        }

        // receive data
        let (header, frame) = self.receive_sdo_response(
                &mut buffer,
                deadline,
                SdoCommandResponse::Upload,
                sdo,
                )?;

        if header.expedited() {
            // expedited transfer
            let size = match header.sized() {
                true => EXPEDITED_MAX_SIZE - usize::from(header.size().value()),
                false => EXPEDITED_MAX_SIZE,
            };
            if size > data.len()
                {return Err(EthercatError::SizeMismatch {expected: Some(data.len()), received: size})}
            let content = frame.get(.. size)
                .ok_or(EthercatError::Protocol("expedited sdo response too short"))?;
            data[.. size].copy_from_slice(content);
            Ok(&mut data[.. size])
        }
        else {
            // normal transfer, eventually segmented
            let mut frame = Cursor::new(frame);
            let total = frame.unpack::<u32>()? as usize;
            if total > data.len()
                {return Err(EthercatError::SizeMismatch {expected: Some(data.len()), received: total})}

            let mut received = Cursor::new(&mut data[.. total]);
            let first = frame.remain().len().min(total);
            received.write(&frame.remain()[.. first])?;

            // receive more data from segments
            let mut toggle = false;
            while received.remain().len() != 0 {
				// send segment request
                {
                    let mut frame = Cursor::new(buffer.as_mut_slice());
                    frame.pack(&CoeHeader::new(u9::new(0), u4::from(CanService::SdoRequest)))?;
                    frame.pack(&SdoSegmentHeader::new(
                            false,
                            u3::new(0),
                            toggle,
                            u3::from(SdoCommandRequest::UploadSegment),
                        ))?;
                    frame.write(&[0; SDO_SEGMENT_MIN_SIZE])?;
                    self.mailbox.write(MailboxType::Can, u2::new(0), frame.finish())?;
                }

				// receive segment
				{
                    let (header, segment) = self.receive_sdo_segment(
                            &mut buffer,
                            deadline,
                            SdoCommandResponse::UploadSegment,
                            toggle,
                            sdo,
                            )?;
                    let size = segment_size(&header, segment);
                    if size > received.remain().len()
                        {return Err(EthercatError::Protocol("slave sent more segment data than announced"))}
                    received.write(&segment[.. size])?;

					if header.last() {break}
                }
				toggle = ! toggle;
            }
            if received.remain().len() != 0
                {return Err(EthercatError::Protocol("slave ended segmented transfer before announced size"))}
            trace!("uploaded {} bytes from sdo {:x} on slave {}", total, sdo.index, self.slave());
            Ok(received.finish())
        }
	}

	/// write an SDO, any size
	pub fn sdo_write<T: PduData>(&mut self, sdo: &Sdo<T>, deadline: Duration, data: T) -> EthercatResult {
        let packed = data.packed()?;
        self.sdo_write_slice(&sdo.downcast(), deadline, packed.as_ref())
	}

	pub fn sdo_write_slice(&mut self, sdo: &Sdo, deadline: Duration, data: &[u8]) -> EthercatResult {
        let mut buffer = [0; MAILBOX_MAX_SIZE];
		if data.len() <= EXPEDITED_MAX_SIZE {
			// expedited transfer
			// send data in the 4 bytes instead of data size
			{
                let mut frame = Cursor::new(buffer.as_mut_slice());
                frame.pack(&CoeHeader::new(u9::new(0), u4::from(CanService::SdoRequest)))?;
                frame.pack(&SdoHeader::new(
                            true,
                            true,
                            u2::new((EXPEDITED_MAX_SIZE - data.len()) as u8),
                            sdo.sub.is_complete(),
                            u3::from(SdoCommandRequest::Download),
                            sdo.index,
                            sdo.sub.unwrap(),
                        ))?;
                frame.write(data)?;
                frame.write(&[0; 4][data.len() ..])?;
                self.mailbox.write(MailboxType::Can, u2::new(0), frame.finish())?;
            }

            // receive acknowledge
            self.receive_sdo_response(
                &mut buffer,
                deadline,
                SdoCommandResponse::Download,
                sdo,
                )?;
		}
		else {
			// normal transfer, eventually segmented
			let mut data = Cursor::new(data);

			// send one download request with the start of data
			{
                let mut frame = Cursor::new(buffer.as_mut_slice());
                frame.pack(&CoeHeader::new(u9::new(0), u4::from(CanService::SdoRequest)))?;
                frame.pack(&SdoHeader::new(
                            true,
                            false,
                            u2::new(0),
                            sdo.sub.is_complete(),
                            u3::from(SdoCommandRequest::Download),
                            sdo.index,
                            sdo.sub.unwrap(),
                        ))?;
                let total = u32::try_from(data.remain().len())
                    .map_err(|_| EthercatError::SizeMismatch {expected: None, received: data.remain().len()})?;
                frame.pack(&total)?;
                let segment = data.remain().len().min(SDO_REQUEST_MAX_SIZE);
                frame.write(data.read(segment)?)?;
                self.mailbox.write(MailboxType::Can, u2::new(0), frame.finish())?;
            }

            // receive acknowledge
            self.receive_sdo_response(
                &mut buffer,
                deadline,
                SdoCommandResponse::Download,
                sdo,
                )?;

            // send many segments for the rest of the data, aknowledge each time
            let mut toggle = false;
            while data.remain().len() != 0 {
                // send segment
                {
                    let segment = data.remain().len().min(SDO_SEGMENT_MAX_SIZE);
                    let content = data.read(segment)?;
                    let padding = SDO_SEGMENT_MIN_SIZE.saturating_sub(segment);
                    let mut frame = Cursor::new(buffer.as_mut_slice());
                    frame.pack(&CoeHeader::new(u9::new(0), u4::from(CanService::SdoRequest)))?;
                    frame.pack(&SdoSegmentHeader::new(
                            data.remain().len() == 0,
                            u3::new(padding as u8),
                            toggle,
                            u3::from(SdoCommandRequest::DownloadSegment),
                        ))?;
                    frame.write(content)?;
                    frame.write(&[0; SDO_SEGMENT_MIN_SIZE][.. padding])?;
                    self.mailbox.write(MailboxType::Can, u2::new(0), frame.finish())?;
                }

                // receive aknowledge
                self.receive_sdo_segment(
                    &mut buffer,
                    deadline,
                    SdoCommandResponse::DownloadSegment,
                    toggle,
                    sdo,
                    )?;
                toggle = !toggle;
            }
		}
        trace!("downloaded {} bytes to sdo {:x} on slave {}", data.len(), sdo.index, self.slave());
        Ok(())
	}

	/// tell the slave the current transfer is given up
	fn send_abort(&mut self, sdo: &Sdo, code: SdoAbortCode) -> EthercatResult {
        let mut buffer = [0; MAILBOX_MAX_SIZE];
        let mut frame = Cursor::new(buffer.as_mut_slice());
        frame.pack(&CoeHeader::new(u9::new(0), u4::from(CanService::SdoRequest)))?;
        frame.pack(&SdoHeader::new(
                false,
                false,
                u2::new(0),
                sdo.sub.is_complete(),
                u3::from(SdoCommandRequest::Abort),
                sdo.index,
                sdo.sub.unwrap(),
            ))?;
        frame.pack(&code.0)?;
        self.mailbox.write(MailboxType::Can, u2::new(0), frame.finish())
	}

	/// read the mailbox, check for abort or unexpected answers
	fn receive_sdo_response<'b>(
        &mut self,
        buffer: &'b mut [u8],
        deadline: Duration,
        expected: SdoCommandResponse,
        sdo: &Sdo,
        ) -> EthercatResult<(SdoHeader, &'b [u8])>
    {
        let slave = self.slave();
        let mut frame = Cursor::new(&*self.mailbox.read(MailboxType::Can, deadline, buffer)?);

        let check_header = |header: &SdoHeader| {
            if header.index() != sdo.index        {return Err(EthercatError::Protocol("slave answered about wrong item"))}
            if header.sub() != sdo.sub.unwrap()   {return Err(EthercatError::Protocol("slave answered about wrong subitem"))}
            Ok(())
        };

        let coe = frame.unpack::<CoeHeader>()?;
        match CanService::try_from(coe.service()) {
            Ok(CanService::SdoResponse) => {
                let header = frame.unpack::<SdoHeader>()?;
                if header.command() != u3::from(expected)
                    {return Err(EthercatError::Protocol("slave answered with wrong operation"))}
                check_header(&header)?;
                Ok((header, frame.remain()))
                },
            Ok(CanService::SdoRequest) => {
                let header = frame.unpack::<SdoHeader>()?;
                if header.command() != u3::from(SdoCommandRequest::Abort)
                    {return Err(EthercatError::Protocol("slave answered a COE request"))}
                check_header(&header)?;
                Err(EthercatError::MailboxAbort {station: slave, code: SdoAbortCode(frame.unpack::<u32>()?)})
                },
            _ => Err(EthercatError::Protocol("unexpected COE service during SDO operation")),
        }
	}

	fn receive_sdo_segment<'b>(
        &mut self,
        buffer: &'b mut [u8],
        deadline: Duration,
        expected: SdoCommandResponse,
        toggle: bool,
        sdo: &Sdo,
        ) -> EthercatResult<(SdoSegmentHeader, &'b [u8])>
    {
        let slave = self.slave();
        let received = self.mailbox.read(MailboxType::Can, deadline, buffer)?;
        let mut frame = Cursor::new(&*received);

        let coe = frame.unpack::<CoeHeader>()?;
        match CanService::try_from(coe.service()) {
            Ok(CanService::SdoResponse) => {
                let header = frame.unpack::<SdoSegmentHeader>()?;
                if header.command() != u3::from(expected)
                    {return Err(EthercatError::Protocol("slave answered with wrong operation"))}
                if header.toggle() != toggle {
                    warn!("bad toggle bit from slave {}, aborting transfer", slave);
                    self.send_abort(sdo, SdoAbortCode::BAD_TOGGLE)?;
                    return Err(EthercatError::Protocol("bad toggle bit in segment received"))
                }
                Ok((header, frame.remain()))
                },
            Ok(CanService::SdoRequest) => {
                let header = frame.unpack::<SdoHeader>()?;
                if header.command() != u3::from(SdoCommandRequest::Abort)
                    {return Err(EthercatError::Protocol("slave answered a COE request"))}
                Err(EthercatError::MailboxAbort {station: slave, code: SdoAbortCode(frame.unpack::<u32>()?)})
                },
            _ => Err(EthercatError::Protocol("unexpected COE service during SDO operation")),
        }
	}
}

/// number of meaningful bytes in a received segment
pub(crate) fn segment_size(header: &SdoSegmentHeader, segment: &[u8]) -> usize {
    if segment.len() == SDO_SEGMENT_MIN_SIZE {
        SDO_SEGMENT_MIN_SIZE - usize::from(header.size().value())
    }
    else {
        segment.len()
    }
}


#[bitsize(16)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct CoeHeader {
    /// present in the Can protocol, but not used in CoE
    pub number: u9,
    reserved: u3,
    /// Can command, as a raw [CanService]
    pub service: u4,
}
data::bilge_pdudata!(CoeHeader, u16);

/**
    Type of can service

    receiving and transmiting is from the point of view of the slave:
        - transmitting is slave -> master
        - receiving is master -> slave
*/
#[bitsize(4)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CanService {
    Emergency = 0x1,
    SdoRequest = 0x2,
    SdoResponse = 0x3,
    TransmitPdo = 0x4,
    ReceivePdo = 0x5,
    TransmitPdoRemoteRequest = 0x6,
    ReceivePdoRemoteRequest = 0x7,
    SdoInformation = 0x8,
}


/// Header for operations with SDOs
///
/// ETG.1000.6 5.6.2
#[bitsize(32)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SdoHeader {
    /// true if field `size` is used
    pub sized: bool,
    /// true in case of an expedited transfer (the data size specified by `size`)
    pub expedited: bool,
    /// indicate the data size but not as an integer.
    /// this value shall be `4 - data.len()`
    pub size: u2,
    /// true if a complete SDO is accessed
    pub complete: bool,
    /// operation to perform with the indexed SDO, this should be a value of [SdoCommandRequest] or [SdoCommandResponse]
    pub command: u3,
    /// SDO index
    pub index: u16,
    /**
    - if subitem is accessed: SDO subindex
    - if complete item is accessed:
        + put 0 to include subindex 0 in transmission
        + put 1 to exclude subindex 0 from transmission
    */
    pub sub: u8,
}
data::bilge_pdudata!(SdoHeader, u32);

/// header of each segment following a non-expedited transfer
///
/// ETG.1000.6 5.6.2.3
#[bitsize(8)]
#[derive(FromBits, DebugBits, Copy, Clone)]
pub struct SdoSegmentHeader {
    /// true for the last segment of the transfer
    pub last: bool,
    /// number of padding bytes in a segment of minimal size
    pub size: u3,
    pub toggle: bool,
    pub command: u3,
}
data::bilge_pdudata!(SdoSegmentHeader, u8);

/// request operation to perform with an SDO in CoE
///
/// ETG.1000.6 5.6.2.1-7
#[bitsize(3)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SdoCommandRequest {
    Download = 0x1,
    DownloadSegment = 0x0,
    Upload = 0x2,
    UploadSegment = 0x3,
    Abort = 0x4,
}

/// response operation to perform with an SDO in CoE
///
/// ETG.1000.6 5.6.2.1-7
#[bitsize(3)]
#[derive(TryFromBits, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SdoCommandResponse {
    Download = 0x3,
    DownloadSegment = 0x1,
    Upload = 0x2,
    UploadSegment = 0x0,
    Abort = 0x4,
}

/**
    code sent by a slave when it refuses an SDO operation

    Slaves may send codes not listed here, so this is a plain integer with named constants rather than a closed enum.

    ETG.1000.6 table 41
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SdoAbortCode(pub u32);

impl SdoAbortCode {
    /// Toggle bit not changed
    pub const BAD_TOGGLE: Self = Self(0x05_03_00_00);
    /// SDO protocol timeout
    pub const TIMEOUT: Self = Self(0x05_04_00_00);
    /// Client/Server command specifier not valid or unknown
    pub const UNSUPPORTED_COMMAND: Self = Self(0x05_04_00_01);
    /// Out of memory
    pub const OUT_OF_MEMORY: Self = Self(0x05_04_00_05);
    /// Unsupported access to an object, this is raised when trying to access a complete SDO when complete SDO access is not supported
    pub const UNSUPPORTED_ACCESS: Self = Self(0x06_01_00_00);
    /// Attempt to read to a write only object
    pub const WRITE_ONLY: Self = Self(0x06_01_00_01);
    /// Attempt to write to a read only object
    pub const READ_ONLY: Self = Self(0x06_01_00_02);
    /// Subindex cannot be written, SI0 must be 0 for write access
    pub const WRITE_ERROR: Self = Self(0x06_01_00_03);
    /// SDO Complete access not supported for objects of variable length such as ENUM object types
    pub const VARIABLE_LENGTH: Self = Self(0x06_01_00_04);
    /// Object length exceeds mailbox size
    pub const OBJECT_TOO_BIG: Self = Self(0x06_01_00_05);
    /// Object mapped to RxPDO, SDO Download blocked
    pub const LOCKED_BY_PDO: Self = Self(0x06_01_00_06);
    /// The object does not exist in the object directory
    pub const INVALID_INDEX: Self = Self(0x06_02_00_00);
    /// The object can not be mapped into the PDO
    pub const CANNOT_MAP: Self = Self(0x06_04_00_41);
    /// The number and length of the objects to be mapped would exceed the PDO length
    pub const PDO_TOO_SMALL: Self = Self(0x06_04_00_42);
    /// General parameter incompatibility reason
    pub const INCOMPATIBLE_PARAMETER: Self = Self(0x06_04_00_43);
    /// General internal incompatibility in the device
    pub const INCOMPATIBLE_DEVICE: Self = Self(0x06_04_00_47);
    /// Access failed due to a hardware error
    pub const HARDWARE_ERROR: Self = Self(0x06_06_00_00);
    /// Data type does not match, length of service parameter does not match
    pub const INVALID_LENGTH: Self = Self(0x06_07_00_10);
    /// Data type does not match, length of service parameter too high
    pub const SERVICE_TOO_BIG: Self = Self(0x06_07_00_12);
    /// Data type does not match, length of service parameter too low
    pub const SERVICE_TOO_SMALL: Self = Self(0x06_07_00_13);
    /// Subindex does not exist
    pub const INVALID_SUBINDEX: Self = Self(0x06_09_00_11);
    /// Value range of parameter exceeded (only for write access)
    pub const VALUE_OUT_OF_RANGE: Self = Self(0x06_09_00_30);
    /// Value of parameter written too high
    pub const VALUE_TOO_HIGH: Self = Self(0x06_09_00_31);
    /// Value of parameter written too low
    pub const VALUE_TOO_LOW: Self = Self(0x06_09_00_32);
    /// Maximum value is less than minimum value
    pub const INVALID_RANGE: Self = Self(0x06_09_00_36);
    /// General error
    pub const GENERAL_ERROR: Self = Self(0x08_00_00_00);
    /// Data cannot be transferred or stored to the application
    pub const TRANSFER_FAILED: Self = Self(0x08_00_00_20);
    /// Data cannot be transferred or stored to the application because of local control
    pub const TRANSFER_FAILED_LOCALLY: Self = Self(0x08_00_00_21);
    /// Data cannot be transferred or stored to the application because of the present device state
    pub const INVALID_STATE: Self = Self(0x08_00_00_22);
    /// Object dictionary dynamic generation fails or no object dictionary is present
    pub const NO_DICTIONARY: Self = Self(0x08_00_00_23);

    /// true if the slave refused the operation because of the data length
    pub fn length_related(self) -> bool {
        self == Self::INVALID_LENGTH
        || self == Self::SERVICE_TOO_BIG
        || self == Self::SERVICE_TOO_SMALL
    }

    /// human readable meaning of the code, `None` for codes not standardized
    pub fn description(self) -> Option<&'static str> {
        Some(match self {
            Self::BAD_TOGGLE => "toggle bit not changed",
            Self::TIMEOUT => "sdo protocol timeout",
            Self::UNSUPPORTED_COMMAND => "command specifier not valid or unknown",
            Self::OUT_OF_MEMORY => "out of memory",
            Self::UNSUPPORTED_ACCESS => "unsupported access to an object",
            Self::WRITE_ONLY => "attempt to read a write only object",
            Self::READ_ONLY => "attempt to write a read only object",
            Self::WRITE_ERROR => "subindex cannot be written",
            Self::VARIABLE_LENGTH => "complete access not supported for variable length objects",
            Self::OBJECT_TOO_BIG => "object length exceeds mailbox size",
            Self::LOCKED_BY_PDO => "object mapped to rxpdo, download blocked",
            Self::INVALID_INDEX => "object does not exist in the dictionary",
            Self::CANNOT_MAP => "object cannot be mapped into the pdo",
            Self::PDO_TOO_SMALL => "mapped objects would exceed the pdo length",
            Self::INCOMPATIBLE_PARAMETER => "general parameter incompatibility",
            Self::INCOMPATIBLE_DEVICE => "general internal incompatibility in the device",
            Self::HARDWARE_ERROR => "access failed due to a hardware error",
            Self::INVALID_LENGTH => "length of service parameter does not match",
            Self::SERVICE_TOO_BIG => "length of service parameter too high",
            Self::SERVICE_TOO_SMALL => "length of service parameter too low",
            Self::INVALID_SUBINDEX => "subindex does not exist",
            Self::VALUE_OUT_OF_RANGE => "value range of parameter exceeded",
            Self::VALUE_TOO_HIGH => "value of parameter written too high",
            Self::VALUE_TOO_LOW => "value of parameter written too low",
            Self::INVALID_RANGE => "maximum value is less than minimum value",
            Self::GENERAL_ERROR => "general error",
            Self::TRANSFER_FAILED => "data cannot be transferred or stored to the application",
            Self::TRANSFER_FAILED_LOCALLY => "data cannot be transferred or stored because of local control",
            Self::INVALID_STATE => "data cannot be transferred or stored in the present device state",
            Self::NO_DICTIONARY => "no object dictionary present",
            _ => return None,
        })
    }
}
impl fmt::Display for SdoAbortCode {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.description() {
            Some(text) => write!(f, "0x{:08x} ({})", self.0, text),
            None => write!(f, "0x{:08x}", self.0),
        }
	}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_layout() {
        let header = SdoHeader::new(
            true, true,
            u2::new(3),
            false,
            u3::from(SdoCommandRequest::Download),
            0x6060, 0);
        assert_eq!(header.packed().unwrap(), [0b0010_1111, 0x60, 0x60, 0]);

        let coe = CoeHeader::new(u9::new(0), u4::from(CanService::SdoRequest));
        assert_eq!(coe.packed().unwrap(), [0, 0x20]);
    }

    #[test]
    fn segment_padding() {
        let header = SdoSegmentHeader::new(true, u3::new(5), false, u3::new(0));
        assert_eq!(segment_size(&header, &[0; 7]), 2);
        let header = SdoSegmentHeader::new(false, u3::new(0), true, u3::new(0));
        assert_eq!(segment_size(&header, &[0; 40]), 40);
    }

    #[test]
    fn abort_codes() {
        assert!(SdoAbortCode(0x0607_0010).length_related());
        assert!(! SdoAbortCode::INVALID_INDEX.length_related());
        assert_eq!(
            SdoAbortCode::INVALID_SUBINDEX.to_string(),
            "0x06090011 (subindex does not exist)",
            );
        assert_eq!(SdoAbortCode(0x1234).to_string(), "0x00001234");
    }
}
