/*!
Convenient structures to address the slave's dictionnary objects (SDO) and describe requests on them.

```ignore
	// the SDOs are declared first somewhere
	let mode = Sdo::<u8>::sub(0x6060, 0);
	let feed = Sdo::<[u8; 8]>::complete(0x6092);

	// and used with a mailbox channel latter in the program
	channel.sdo_write(station, &mode, 8)?;
	let request = SdoRequest::write(station, 0x6071, 0, 0x0200u16.to_le_bytes().to_vec());
	channel.execute(request)?;
```
*/

use crate::{
	data::PduData,
	error::{EthercatError, EthercatResult},
	};
use core::{fmt, marker::PhantomData};


/// description of an SDO's subitem, not a SDO itself
pub struct Sdo<T: PduData = ()> {
	/// index of the item in the slave's dictionnary of objects
	pub index: u16,
	/// subindex in the item
	pub sub: SdoPart,
	extracted: PhantomData<T>,
}
/// specifies which part of an SDO is addressed
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SdoPart {
    /// the whole SDO from the given subitem to the last one, with their eventual paddings
    ///
    /// starting at 0 includes the subitem count, starting at 1 excludes it
    Complete(u8),
    /// one subitem value in the SDO
    Sub(u8),
}
impl<T: PduData> Sdo<T> {
	/// address an sdo subitem
	pub const fn sub(index: u16, sub: u8) -> Self { Self{
		index,
		sub: SdoPart::Sub(sub),
		extracted: PhantomData,
	}}
	/// address a complete sdo at the given index, with `sub=0`
	pub const fn complete(index: u16) -> Self { Self{
		index,
		sub: SdoPart::Complete(0),
		extracted: PhantomData,
	}}
	/// address a complete sdo at the given index, starting from subitem `sub`
	pub const fn complete_from(index: u16, sub: u8) -> Self { Self{
		index,
		sub: SdoPart::Complete(sub),
		extracted: PhantomData,
	}}
	/// erase the value type, to address the sdo with byte slices
	pub fn downcast(&self) -> Sdo { Sdo {
		index: self.index,
		sub: self.sub,
		extracted: PhantomData,
	}}
}
impl SdoPart {
    /// subindex put on the wire, the first transmitted subitem for a complete item
    pub fn unwrap(self) -> u8 { match self {
            Self::Complete(i) => i,
            Self::Sub(i) => i,
    }}
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}
impl<T: PduData> fmt::Debug for Sdo<T> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Sdo {{index: {:x}, sub: {:?}}}", self.index, self.sub)
	}
}
// [Clone] and [Copy] must be implemented manually to allow copying a sdo pointing to a type which does not implement this operation
impl<T: PduData> Clone for Sdo<T> {
    fn clone(&self) -> Self  {Self {index: self.index, sub: self.sub, extracted: PhantomData}}
}
impl<T: PduData> Copy for Sdo<T> {}


/// direction of an [SdoRequest]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SdoOperation {
    Read,
    Write,
}

/**
    one acyclic operation on a slave's object dictionnary

    A request declares the size of the object it addresses: a write request must carry exactly this number of bytes, a read request accepts at most this number of bytes. With complete access, the size is the size of the whole object.

    A request is consumed by its execution. Hooks that must be replayed on each bring-up keep their requests and execute clones of them.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SdoRequest {
    /// fixed address of the targeted slave
    pub station: u16,
    pub index: u16,
    pub sub: u8,
    /// access the whole object starting at `sub` rather than one subitem
    pub complete: bool,
    pub operation: SdoOperation,
    /// bytes to write, empty for read requests
    pub payload: Vec<u8>,
    /// declared byte size of the addressed object
    pub size: usize,
}
impl SdoRequest {
    /// write request, declaring the object size from the payload
    pub fn write(station: u16, index: u16, sub: u8, payload: Vec<u8>) -> Self {
        Self {
            station, index, sub,
            complete: false,
            operation: SdoOperation::Write,
            size: payload.len(),
            payload,
        }
    }
    /// read request, accepting up to `size` bytes
    pub fn read(station: u16, index: u16, sub: u8, size: usize) -> Self {
        Self {
            station, index, sub,
            complete: false,
            operation: SdoOperation::Read,
            payload: Vec::new(),
            size,
        }
    }
    /// switch to complete access
    pub fn complete(mut self) -> Self {
        self.complete = true;
        self
    }
    /// declare the size of the addressed object
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
    /// sdo addressed by this request
    pub fn sdo(&self) -> Sdo {
        if self.complete {
            Sdo::complete_from(self.index, self.sub)
        }
        else {
            Sdo::sub(self.index, self.sub)
        }
    }
    /// check the payload against the declared size
    pub fn validate(&self) -> EthercatResult {
        if self.size == 0
            {return Err(EthercatError::SizeMismatch {expected: None, received: 0})}
        match self.operation {
            SdoOperation::Write if self.payload.len() != self.size
                => Err(EthercatError::SizeMismatch {expected: Some(self.size), received: self.payload.len()}),
            SdoOperation::Read if ! self.payload.is_empty()
                => Err(EthercatError::Configuration("read request with a payload".into())),
            _ => Ok(()),
        }
    }
}
impl fmt::Display for SdoRequest {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{:?} {:04x}:{}{} on slave {}",
            self.operation, self.index, self.sub,
            if self.complete {" (complete)"} else {""},
            self.station)
	}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_sizes() {
        let request = SdoRequest::write(1, 0x6071, 0, vec![0x00, 0x02]);
        assert!(request.validate().is_ok());
        assert_eq!(request.sdo().sub, SdoPart::Sub(0));

        let partial = SdoRequest::write(1, 0x1c12, 0, vec![1, 0, 0x16]).complete().with_size(4);
        assert!(matches!(
            partial.validate(),
            Err(EthercatError::SizeMismatch {expected: Some(4), received: 3}),
            ));
        assert!(partial.sdo().sub.is_complete());
        assert_eq!(SdoRequest::read(1, 0x1c12, 1, 8).complete().sdo().sub, SdoPart::Complete(1));

        assert!(SdoRequest::read(1, 0x6060, 0, 4).validate().is_ok());
        assert!(SdoRequest::read(1, 0x6060, 0, 0).validate().is_err());
    }
}
