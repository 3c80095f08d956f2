//! Reading values back out of a [`Message`].

use crate::varint;

use super::{Message, ReadError};

/// A value which can be consumed from a [`Message`].
pub trait Decode: Sized {
    /// Consumes one value at the message's read cursor.
    ///
    /// # Errors
    ///
    /// Errors if not enough written bits remain, or the bits are not a valid
    /// encoding of this type.
    fn decode(msg: &mut Message) -> Result<Self, ReadError>;
}

macro_rules! impl_decode_uint {
    ($ty:ty, $bits:literal) => {
        impl Decode for $ty {
            fn decode(msg: &mut Message) -> Result<Self, ReadError> {
                #[allow(clippy::cast_possible_truncation)]
                Ok(msg.read_bits($bits)? as $ty)
            }
        }
    };
}

impl_decode_uint!(u8, 8);
impl_decode_uint!(u16, 16);
impl_decode_uint!(u32, 32);
impl_decode_uint!(u64, 64);

macro_rules! impl_decode_int {
    ($ty:ty, $as_uint:ty, $bits:literal) => {
        impl Decode for $ty {
            fn decode(msg: &mut Message) -> Result<Self, ReadError> {
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                Ok((msg.read_bits($bits)? as $as_uint) as $ty)
            }
        }
    };
}

impl_decode_int!(i8, u8, 8);
impl_decode_int!(i16, u16, 16);
impl_decode_int!(i32, u32, 32);
impl_decode_int!(i64, u64, 64);

impl Decode for bool {
    fn decode(msg: &mut Message) -> Result<Self, ReadError> {
        Ok(msg.read_bits(1)? == 1)
    }
}

impl Decode for f32 {
    fn decode(msg: &mut Message) -> Result<Self, ReadError> {
        #[allow(clippy::cast_possible_truncation)]
        Ok(Self::from_bits(msg.read_bits(32)? as u32))
    }
}

impl Decode for f64 {
    fn decode(msg: &mut Message) -> Result<Self, ReadError> {
        Ok(Self::from_bits(msg.read_bits(64)?))
    }
}

impl Decode for String {
    fn decode(msg: &mut Message) -> Result<Self, ReadError> {
        let len = msg.read_len()?;
        let mut bytes = Vec::new();
        for _ in 0..len {
            #[allow(clippy::cast_possible_truncation)]
            bytes.push(msg.read_bits(8)? as u8);
        }
        Ok(Self::from_utf8(bytes)?)
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(msg: &mut Message) -> Result<Self, ReadError> {
        let len = msg.read_len()?;
        // the length prefix is untrusted, so grow as elements actually decode
        // instead of reserving up front
        let mut values = Self::new();
        for _ in 0..len {
            values.push(T::decode(msg)?);
        }
        Ok(values)
    }
}

impl Message {
    /// Consumes a value at the read cursor.
    ///
    /// # Errors
    ///
    /// Errors if not enough written bits remain, or the bits are not a valid
    /// encoding of `T`.
    ///
    /// # Example
    ///
    /// ```
    /// # use riptide_proto::{header::HeaderTag, msg::{Message, MAX_SIZE}};
    /// let mut msg = Message::new(HeaderTag::Unreliable, MAX_SIZE);
    /// msg.write(&-42_i16)?;
    /// msg.write("hi")?;
    /// assert_eq!(-42, msg.read::<i16>()?);
    /// assert_eq!("hi", msg.read::<String>()?);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn read<T: Decode>(&mut self) -> Result<T, ReadError> {
        T::decode(self)
    }

    /// Consumes a [`crate::varint`] length prefix.
    pub(crate) fn read_len(&mut self) -> Result<usize, ReadError> {
        #[allow(clippy::cast_possible_truncation)]
        let first = self.read_bits(8)? as u8;
        if varint::is_extended(first) {
            #[allow(clippy::cast_possible_truncation)]
            let second = self.read_bits(8)? as u8;
            Ok(varint::decode_extended(first, second))
        } else {
            Ok(varint::decode_single(first))
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::{header::HeaderTag, msg::MAX_SIZE};

    use super::*;

    fn msg() -> Message {
        Message::new(HeaderTag::Unreliable, MAX_SIZE)
    }

    #[test]
    fn mixed_sequence_round_trip() {
        let mut msg = msg();
        msg.write(&true).unwrap();
        msg.write(&false).unwrap();
        msg.write(&0xAB_u8).unwrap();
        msg.write(&-1234_i16).unwrap();
        msg.write(&0xDEAD_BEEF_u32).unwrap();
        msg.write(&-1_i64).unwrap();
        msg.write(&core::f32::consts::PI).unwrap();
        msg.write(&core::f64::consts::E).unwrap();
        msg.write("riptide ≈ 1225").unwrap();
        msg.write(&[3_u16, 1, 4, 1, 5][..]).unwrap();

        assert!(msg.read::<bool>().unwrap());
        assert!(!msg.read::<bool>().unwrap());
        assert_eq!(0xAB, msg.read::<u8>().unwrap());
        assert_eq!(-1234, msg.read::<i16>().unwrap());
        assert_eq!(0xDEAD_BEEF, msg.read::<u32>().unwrap());
        assert_eq!(-1, msg.read::<i64>().unwrap());
        assert_eq!(core::f32::consts::PI, msg.read::<f32>().unwrap());
        assert_eq!(core::f64::consts::E, msg.read::<f64>().unwrap());
        assert_eq!("riptide ≈ 1225", msg.read::<String>().unwrap());
        assert_eq!(vec![3_u16, 1, 4, 1, 5], msg.read::<Vec<u16>>().unwrap());
        assert_eq!(0, msg.bits_unread());
    }

    #[test]
    fn floats_preserve_bit_patterns() {
        let mut msg = msg();
        msg.write(&f32::NAN).unwrap();
        msg.write(&-0.0_f64).unwrap();
        assert!(msg.read::<f32>().unwrap().is_nan());
        assert!(msg.read::<f64>().unwrap().is_sign_negative());
    }

    #[test]
    fn varint_boundary_lengths() {
        // 127 elements: 1-byte length prefix
        let mut msg = msg();
        let start = msg.bits_written();
        msg.write(&vec![0_u8; 127][..]).unwrap();
        assert_eq!(start + 8 + 127 * 8, msg.bits_written());
        assert_eq!(127, msg.read::<Vec<u8>>().unwrap().len());

        // 128 elements: 2-byte length prefix
        let mut msg = self::msg();
        let start = msg.bits_written();
        msg.write(&vec![0_u8; 128][..]).unwrap();
        assert_eq!(start + 16 + 128 * 8, msg.bits_written());
        assert_eq!(128, msg.read::<Vec<u8>>().unwrap().len());
    }

    #[test]
    fn truncated_array_fails_cleanly() {
        let mut msg = msg();
        // length prefix promising 200 bytes, but only one present
        msg.write_len(200).unwrap();
        msg.write(&1_u8).unwrap();
        assert_matches!(msg.read::<Vec<u8>>(), Err(ReadError::EndOfBuffer { .. }));
    }

    #[test]
    fn invalid_utf8_fails_cleanly() {
        let mut msg = msg();
        msg.write_len(1).unwrap();
        msg.write(&0xFF_u8).unwrap();
        assert_matches!(msg.read::<String>(), Err(ReadError::InvalidUtf8(_)));
    }

    #[test]
    fn unaligned_string_round_trip() {
        let mut msg = msg();
        msg.write(&true).unwrap();
        msg.write("offset by one bit").unwrap();
        assert!(msg.read::<bool>().unwrap());
        assert_eq!("offset by one bit", msg.read::<String>().unwrap());
    }
}
