// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::ErrorKind;
use std::io::Write;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BitWriterError {
    #[error("invalid bit count")]
    InvalidBitCount,
    #[error("bitstream overflow, the output cannot grow anymore")]
    Overflow,
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for BitWriterError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::WriteZero => BitWriterError::Overflow,
            _ => BitWriterError::Io(err),
        }
    }
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

/// MSB-first bit writer on top of [`std::io::Write`].
pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes the low `bits` bits of `value`, most significant first. At most 32 bits can be
    /// written at once.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        for bit in (0..bits).rev() {
            self.write_bit((value >> bit) & 1 == 1)?;
        }

        Ok(bits)
    }

    /// Takes a single bit that will be outputed to [`std::io::Write`]
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            let byte = self.curr_byte;
            self.nth_bit = 0;
            self.curr_byte = 0;
            self.out.write_all(&[byte])?;
        }

        Ok(())
    }

    /// Pads the pending byte with zeros and outputs it, then flushes the inner writer.
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            let byte = self.curr_byte;
            self.nth_bit = 0;
            self.curr_byte = 0;
            self.out.write_all(&[byte])?;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Returns `true` if ['Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }

    /// Number of bits held in the pending byte.
    pub fn pending_bits(&self) -> usize {
        self.nth_bit as usize
    }

    pub(crate) fn inner(&self) -> &W {
        &self.out
    }

    pub(crate) fn inner_mut(&mut self) -> &mut W {
        &mut self.out
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitwriter_f1() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            for bit in [true, false, false, false, true, true, true, true] {
                writer.write_f(1, bit).unwrap();
            }
        }
        assert_eq!(buf, vec![0b10001111u8]);
    }

    #[test]
    fn test_bitwriter_f3() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            writer.write_f(3, 0b100u8).unwrap();
            writer.write_f(3, 0b101u8).unwrap();
            writer.write_f(3, 0b011u8).unwrap();
            assert_eq!(writer.pending_bits(), 1);
        }
        assert_eq!(buf, vec![0b10010101u8, 0b10000000u8]);
    }

    #[test]
    fn test_bitwriter_wide_values() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = BitWriter::new(&mut buf);
            assert_eq!(writer.write_f(32, 0xdeadbeefu32).unwrap(), 32);
            writer.write_f(4, 0xffu8).unwrap();
            assert!(matches!(
                writer.write_f(33, 0u32),
                Err(BitWriterError::InvalidBitCount)
            ));
        }
        assert_eq!(buf, vec![0xde, 0xad, 0xbe, 0xef, 0xf0]);
    }

    #[test]
    fn test_bitwriter_overflow() {
        let mut storage = [0u8; 2];
        let mut writer = BitWriter::new(&mut storage[..]);

        writer.write_f(16, 0xabcdu32).unwrap();
        assert!(matches!(
            writer.write_f(8, 0x01u8),
            Err(BitWriterError::Overflow)
        ));
        drop(writer);

        assert_eq!(storage, [0xab, 0xcd]);
    }
}
