//! Traits and impls used to read/write data to/from the wire and the process image.

use core::{
	marker::PhantomData,
	fmt,
	};

/**
	trait for data types than can be packed/unpacked to/from a PDU
*/
pub trait PduData: Sized {
    const ID: DataType;
    type Packed: Storage;

    fn pack(&self, dst: &mut [u8]) -> PackingResult<()>;
    fn unpack(src: &[u8]) -> PackingResult<Self>;

    fn packed_size() -> usize  {Self::Packed::LEN}
    fn packed_bitsize() -> usize {Self::Packed::LEN*8}

    /// convenience returning the packed bytes of this value
    fn packed(&self) -> PackingResult<Self::Packed> {
        let mut buffer = Self::Packed::zeroed();
        self.pack(buffer.as_mut())?;
        Ok(buffer)
    }
}

/** Enum to identify and raise adapted error raised by this package
*/
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PackingError {
    #[error("bad size {0}: {1}")]
    BadSize(usize, &'static str),
    #[error("bad alignment {0}: {1}")]
    BadAlignment(usize, &'static str),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
}

pub type PackingResult<T> = Result<T, PackingError>;


/// this trait is an equivalent to `packed_struct::ByteArray` but since rust doesn't actually support using generic consts in const expressions, we do not have choice
pub trait Storage: AsRef<[u8]> + AsMut<[u8]> {
    const LEN: usize;
    fn zeroed() -> Self;
}
impl<const N: usize> Storage for [u8; N] {
    const LEN: usize = N;
    fn zeroed() -> Self {[0; N]}
}

/** data type tags, allowing to dynamically check the type of a [PduData] implementor or of a process image variable

	It is only covering the common useful types and not all the possible implementors of [PduData]
*/
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub enum DataType {
	/// default value of the enum, used in case the matching data does not fit in any of these integers
	#[default]
	Custom,
	Void, Bool,
	I8, I16, I32, I64,
	U8, U16, U32, U64,
	F32, F64,
}
impl DataType {
    /// nominal bit size of the type, `None` for types without fixed size like paddings
    pub fn bitsize(self) -> Option<usize> {
        match self {
            Self::Custom | Self::Void => None,
            Self::Bool => Some(1),
            Self::I8 | Self::U8 => Some(8),
            Self::I16 | Self::U16 => Some(16),
            Self::I32 | Self::U32 | Self::F32 => Some(32),
            Self::I64 | Self::U64 | Self::F64 => Some(64),
        }
    }
}

impl<const N: usize> PduData for [u8; N] {
	const ID: DataType = DataType::Custom;
	type Packed = Self;

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()> {
        if dst.len() < N
            {return Err(PackingError::BadSize(dst.len(), "not enough bytes for desired slice"))}
        dst[.. N].copy_from_slice(self);
        Ok(())
    }
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        src.get(.. N)
            .and_then(|s| Self::try_from(s).ok())
            .ok_or(PackingError::BadSize(src.len(), "not enough bytes for desired slice"))
	}
}

impl PduData for () {
	const ID: DataType = DataType::Void;
	type Packed = [u8; 0];

	fn pack(&self, _dst: &mut [u8]) -> PackingResult<()>  {Ok(())}
	fn unpack(_src: &[u8]) -> PackingResult<Self>  {Ok(())}
}

impl PduData for bool {
	const ID: DataType = DataType::Bool;
	type Packed = [u8; 1];

	fn pack(&self, dst: &mut [u8]) -> PackingResult<()>  {
        if dst.len() < Self::Packed::LEN
            {return Err(PackingError::BadSize(dst.len(), "no byte for bool"))}
        dst[0] = if *self {0b1} else {0b0};
        Ok(())
	}
	fn unpack(src: &[u8]) -> PackingResult<Self>  {
        if src.len() < Self::Packed::LEN
            {return Err(PackingError::BadSize(src.len(), "no byte for bool"))}
		Ok(src[0] & 0b1 == 0b1)
	}
}

/// macro implementing [PduData] for a given struct generated with `bilge`
///
/// `$id` is the primitive integer backing the bitfield, the struct is packed little endian as any ethercat register
macro_rules! bilge_pdudata {
    ($t: ty, $id: ty) => { impl crate::data::PduData for $t {
        const ID: crate::data::DataType = crate::data::DataType::Custom;
        type Packed = [u8; core::mem::size_of::<$id>()];

        fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
            use crate::data::Storage;
            if dst.len() < Self::Packed::LEN
                {return Err(crate::data::PackingError::BadSize(dst.len(), "bilge struct needs exact size"))}
            dst[.. Self::Packed::LEN].copy_from_slice(&<$id>::from(*self).to_le_bytes());
            Ok(())
        }
        fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
            use crate::data::Storage;
            let raw = src.get(.. Self::Packed::LEN)
                .and_then(|s| <Self::Packed>::try_from(s).ok())
                .ok_or(crate::data::PackingError::BadSize(src.len(), "bilge struct needs exact size"))?;
            <Self as TryFrom<$id>>::try_from(<$id>::from_le_bytes(raw))
                .map_err(|_| crate::data::PackingError::InvalidValue("bit pattern not allowed by bilge struct"))
        }
    }};
}
pub(crate) use bilge_pdudata;

/// macro implementing [PduData] for numeric types
macro_rules! num_pdudata {
	($t: ty, $id: ident) => { impl crate::data::PduData for $t {
			const ID: crate::data::DataType = crate::data::DataType::$id;
            type Packed = [u8; core::mem::size_of::<$t>()];

            fn pack(&self, dst: &mut [u8]) -> crate::data::PackingResult<()> {
                let size = core::mem::size_of::<$t>();
                if dst.len() < size
                    {return Err(crate::data::PackingError::BadSize(dst.len(), "not enough bytes for integer"))}
				dst[.. size].copy_from_slice(&self.to_le_bytes());
				Ok(())
			}
			fn unpack(src: &[u8]) -> crate::data::PackingResult<Self> {
				Ok(Self::from_le_bytes(src
                    .get(.. core::mem::size_of::<$t>())
					.and_then(|s| s.try_into().ok())
					.ok_or(crate::data::PackingError::BadSize(src.len(), "not enough bytes for integer"))?
					))
			}
		}};
}

num_pdudata!(u8, U8);
num_pdudata!(u16, U16);
num_pdudata!(u32, U32);
num_pdudata!(u64, U64);
num_pdudata!(i8, I8);
num_pdudata!(i16, I16);
num_pdudata!(i32, I32);
num_pdudata!(i64, I64);
num_pdudata!(f32, F32);
num_pdudata!(f64, F64);


/**
	locate some data in a datagram by its byte position and length, which must be extracted to type `T` to be processed in rust

	It acts like a getter/setter of a value in a byte sequence. One can think of it as an offset to a data location because it does not actually point the data but only its offset in the byte sequence, it also contains its length to dynamically check memory bounds.
*/
#[derive(Default, Eq, Hash)]
pub struct Field<T: PduData> {
    /// this is only here to mark that T is actually used
	extracted: PhantomData<T>,
	/// start byte index of the object
	pub byte: usize,
	/// byte length of the object
	pub len: usize,
}
impl<T: PduData> Field<T>
{
	/// build a Field from its byte offset and byte length
	pub const fn new(byte: usize, len: usize) -> Self {
		Self{extracted: PhantomData, byte, len}
	}
	/// build a Field from its byte offset, infering its length from the data nominal size
	pub const fn simple(byte: usize) -> Self {
        Self{extracted: PhantomData, byte, len: T::Packed::LEN}
	}

	/// extract the value pointed by the field in the given byte array
	pub fn get(&self, data: &[u8]) -> PackingResult<T> {
		T::unpack(self.slice(data)?)
	}
	/// dump the given value to the place pointed by the field in the byte array
	pub fn set(&self, data: &mut [u8], value: T) -> PackingResult<()> {
        let end = self.byte + self.len;
        let place = data.get_mut(self.byte .. end)
            .ok_or(PackingError::BadSize(end, "field out of data"))?;
        value.pack(place)
	}
	fn slice<'a>(&self, data: &'a [u8]) -> PackingResult<&'a [u8]> {
        let end = self.byte + self.len;
        data.get(self.byte .. end)
            .ok_or(PackingError::BadSize(end, "field out of data"))
	}
}
impl<T: PduData> fmt::Debug for Field<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Field{{0x{:x}, {}}}", self.byte, self.len)
	}
}
// [Clone] and [Copy] must be implemented manually to allow copying a field pointing to a type which does not implement this operation
impl<T: PduData> Clone for Field<T> {
    fn clone(&self) -> Self   {Self::new(self.byte, self.len)}
}
impl<T: PduData> Copy for Field<T> {}
impl<T: PduData> PartialEq for Field<T> {
    fn eq(&self, other: &Self) -> bool {
        self.byte == other.byte && self.len == other.len
    }
}


/// mask of the `len` lowest bits
pub const fn mask(len: usize) -> u64 {
    if len >= 64  {u64::MAX}
    else          {(1u64 << len) - 1}
}

/// gather the bytes covering `len` bits from `bit` into one little endian word, returning the word and the byte range
fn bit_window(data: &[u8], bit: usize, len: usize) -> PackingResult<(u128, usize, usize)> {
    if len == 0 || len > 64
        {return Err(PackingError::BadAlignment(len, "bit length must be in 1..=64"))}
    let start = bit / 8;
    let end = (bit + len + 7) / 8;
    let bytes = data.get(start .. end)
        .ok_or(PackingError::BadSize(end, "bit range out of data"))?;
    let mut word = [0u8; 16];
    word[.. bytes.len()].copy_from_slice(bytes);
    Ok((u128::from_le_bytes(word), start, end))
}

/// masked bit extraction: `(word >> bit) & mask(len)`
pub fn read_bits(data: &[u8], bit: usize, len: usize) -> PackingResult<u64> {
    let (word, _, _) = bit_window(data, bit, len)?;
    Ok(((word >> (bit % 8)) as u64) & mask(len))
}

/// masked bit insertion: clears the `len` bits at `bit` then ors in `value` (truncated to `len` bits)
pub fn write_bits(data: &mut [u8], bit: usize, len: usize, value: u64) -> PackingResult<()> {
    let (word, start, end) = bit_window(data, bit, len)?;
    let shift = bit % 8;
    let mask = u128::from(mask(len)) << shift;
    let word = (word & !mask) | ((u128::from(value) << shift) & mask);
    data[start .. end].copy_from_slice(&word.to_le_bytes()[.. end - start]);
    Ok(())
}

/// copy `len` bits from a bit position in `src` to a bit position in `dst`, bits around the destination range are preserved
pub fn copy_bits(src: &[u8], src_bit: usize, dst: &mut [u8], dst_bit: usize, len: usize) -> PackingResult<()> {
    let mut done = 0;
    while done < len {
        let chunk = (len - done).min(64);
        let value = read_bits(src, src_bit + done, chunk)?;
        write_bits(dst, dst_bit + done, chunk, value)?;
        done += chunk;
    }
    Ok(())
}


/** helper to read/write sequencial data from/to a byte slice

    It is close to what [std::io::Cursor] is doing, but this struct allows reading forward without consuming the stream, and returns slices without copying the data. It is also meant to work with [PduData]

    Depending on the mutability of the slice this struct is built on, different capabilities are provided.
*/
pub struct Cursor<T> {
    position: usize,
    data: T,
}
impl<T> Cursor<T> {
    /// create a new cursor starting at position zero in the given slice
    pub fn new(data: T) -> Self   {Self{position: 0, data}}
    /** current position in the read/write slice

    bytes before this position are considered read or written, and bytes after are coming for use in next read/write calls
    */
    pub fn position(&self) -> usize   {self.position}
}
impl<'a> Cursor<&'a [u8]> {
    /// read the next coming bytes with a [PduData] value, and increment the position
    pub fn unpack<T: PduData>(&mut self) -> PackingResult<T> {
        let value = T::unpack(self.read(T::Packed::LEN)?)?;
        Ok(value)
    }
    /// read the next coming `size` bytes and increment the position
    pub fn read(&mut self, size: usize) -> PackingResult<&'a [u8]> {
        let start = self.position;
        let data: &'a [u8] = self.data;
        let slice = data.get(start .. start + size)
            .ok_or(PackingError::BadSize(start + size, "reading past the end of data"))?;
        self.position += size;
        Ok(slice)
    }
    /// return all the remaining bytes after current position, but does not advance the cursor
    pub fn remain(&self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        &data[self.position ..]
    }
    /// consume self and return a slice until current position
    pub fn finish(self) -> &'a [u8] {
        &self.data[.. self.position]
    }
}
impl<'a> Cursor<&'a mut [u8]> {
    /// write the next coming bytes with a [PduData] value, and increment the position
    pub fn pack<T: PduData>(&mut self, value: &T) -> PackingResult<()> {
        let start = self.position;
        let place = self.data.get_mut(start .. start + T::Packed::LEN)
            .ok_or(PackingError::BadSize(start + T::Packed::LEN, "writing past the end of data"))?;
        value.pack(place)?;
        self.position += T::Packed::LEN;
        Ok(())
    }
    /// write the next coming bytes with the given slice, and increment the position
    pub fn write(&mut self, value: &[u8]) -> PackingResult<()> {
        let start = self.position;
        let place = self.data.get_mut(start .. start + value.len())
            .ok_or(PackingError::BadSize(start + value.len(), "writing past the end of data"))?;
        place.copy_from_slice(value);
        self.position += value.len();
        Ok(())
    }
    /// return all the remaining bytes after current position, but does not advance the cursor
    pub fn remain(&mut self) -> &'_ mut [u8] {
        &mut self.data[self.position ..]
    }
    /// consume self and return a slice until current position
    pub fn finish(self) -> &'a mut [u8] {
        &mut self.data[.. self.position]
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_across_bytes() {
        let mut data = [0xffu8; 4];
        write_bits(&mut data, 6, 12, 0).unwrap();
        assert_eq!(data, [0x3f, 0x00, 0xfc, 0xff]);
        write_bits(&mut data, 6, 12, 0xabc).unwrap();
        assert_eq!(read_bits(&data, 6, 12).unwrap(), 0xabc);
        // neighbours untouched
        assert_eq!(read_bits(&data, 0, 6).unwrap(), 0x3f);
        assert_eq!(read_bits(&data, 18, 14).unwrap(), 0x3fff);
    }

    #[test]
    fn bits_full_width() {
        let mut data = [0u8; 9];
        write_bits(&mut data, 7, 64, u64::MAX).unwrap();
        assert_eq!(read_bits(&data, 7, 64).unwrap(), u64::MAX);
        assert_eq!(data[0], 0x80);
        assert_eq!(data[8], 0x7f);
    }

    #[test]
    fn bits_bounds() {
        let data = [0u8; 2];
        assert!(read_bits(&data, 10, 8).is_err());
        assert!(read_bits(&data, 0, 0).is_err());
        assert!(read_bits(&data, 0, 65).is_err());
    }

    #[test]
    fn copy_long_range() {
        let src = (0 .. 20u8).collect::<Vec<_>>();
        let mut dst = vec![0u8; 22];
        copy_bits(&src, 0, &mut dst, 12, 160).unwrap();
        for i in 0 .. 160 {
            assert_eq!(read_bits(&src, i, 1).unwrap(), read_bits(&dst, 12+i, 1).unwrap());
        }
        assert_eq!(read_bits(&dst, 0, 12).unwrap(), 0);
    }

    #[test]
    fn cursor_bounds() {
        let mut buffer = [0u8; 3];
        let mut cursor = Cursor::new(buffer.as_mut_slice());
        cursor.pack(&0x0102u16).unwrap();
        assert!(cursor.pack(&0u16).is_err());
        cursor.write(&[7]).unwrap();
        assert_eq!(cursor.finish(), &[0x02, 0x01, 7]);

        let mut cursor = Cursor::new(buffer.as_slice());
        assert_eq!(cursor.unpack::<u16>().unwrap(), 0x0102);
        assert_eq!(cursor.remain(), &[7]);
        assert!(cursor.read(2).is_err());
    }
}
