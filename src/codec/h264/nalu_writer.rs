// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.
use std::io::Write;

use thiserror::Error;

use crate::bitstream_utils::BitWriter;
use crate::bitstream_utils::BitWriterError;

/// Annex B start code prefix, including the leading zero byte.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Internal wrapper over [`std::io::Write`] inserting emulation prevention bytes and counting
/// what reached the output.
struct EmulationPrevention<W: Write> {
    out: W,

    /// Number of consecutive zero bytes written last.
    zeros: u8,

    /// Total bytes written to `out`, emulation prevention bytes included.
    emitted: usize,

    /// Emulation prevention enabled.
    ep_enabled: bool,
}

impl<W: Write> EmulationPrevention<W> {
    fn new(writer: W, ep_enabled: bool) -> Self {
        Self {
            out: writer,
            zeros: 0,
            emitted: 0,
            ep_enabled,
        }
    }

    fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.out.write_all(bytes)?;
        self.emitted += bytes.len();
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> std::io::Result<()> {
        if self.ep_enabled && self.zeros >= 2 && byte <= 0x03 {
            self.write_raw(&[0x03])?;
            self.zeros = 0;
        }

        self.write_raw(&[byte])?;
        self.zeros = if byte == 0x00 { self.zeros + 1 } else { 0 };

        Ok(())
    }

    /// Writes the start code and the one byte H.264 NALU header. These bytes are never subject
    /// to emulation prevention.
    fn write_header(&mut self, idc: u8, type_: u8) -> std::io::Result<()> {
        self.write_raw(&START_CODE)?;
        self.write_raw(&[(idc & 0b11) << 5 | (type_ & 0b11111)])?;
        self.zeros = 0;

        Ok(())
    }
}

impl<W: Write> Write for EmulationPrevention<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for byte in buf {
            self.write_byte(*byte)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }
}

#[derive(Error, Debug)]
pub enum NaluWriterError {
    #[error("value increment caused value overflow")]
    Overflow,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    BitWriterError(#[from] BitWriterError),
}

pub type NaluWriterResult<T> = std::result::Result<T, NaluWriterError>;

/// A writer for H.264 bitstream. It is capable of outputing bitstream with
/// emulation-prevention.
pub struct NaluWriter<W: Write>(BitWriter<EmulationPrevention<W>>);

impl<W: Write> NaluWriter<W> {
    pub fn new(writer: W, ep_enabled: bool) -> Self {
        Self(BitWriter::new(EmulationPrevention::new(writer, ep_enabled)))
    }

    /// Writes fixed bit size integer (up to 32 bit) output with emulation
    /// prevention if enabled. Corresponds to `f(n)` in H.264 spec.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.0
            .write_f(bits, value)
            .map_err(NaluWriterError::BitWriterError)
    }

    /// An alias to [`Self::write_f`] Corresponds to `u(n)` in H.264 spec.
    pub fn write_u<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.write_f(bits, value)
    }

    /// Writes a number in exponential golomb format: `value + 1` in binary, preceded by as many
    /// zeros as it has bits after the leading one.
    pub fn write_exp_golomb(&mut self, value: u32) -> NaluWriterResult<()> {
        let code_num = value.checked_add(1).ok_or(NaluWriterError::Overflow)?;
        let bits = 32 - code_num.leading_zeros() as usize;
        let zeros = bits - 1;

        self.write_f(zeros, 0u32)?;
        self.write_f(bits, code_num)?;

        Ok(())
    }

    /// Writes a unsigned integer in exponential golomb format.
    /// Coresponds to `ue(v)` in H.264 spec.
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> NaluWriterResult<()> {
        self.write_exp_golomb(value.into())
    }

    /// Writes a signed integer in exponential golomb format.
    /// Coresponds to `se(v)` in H.264 spec.
    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> NaluWriterResult<()> {
        let value: i32 = value.into();
        let abs_value: u32 = value.unsigned_abs();

        let code_num = if value <= 0 {
            abs_value.checked_mul(2)
        } else {
            Some(2 * abs_value - 1)
        };

        self.write_ue(code_num.ok_or(NaluWriterError::Overflow)?)
    }

    /// Returns `true` if ['Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.0.has_data_pending()
    }

    /// Writes the start code and the H.264 NALU header.
    pub fn write_header(&mut self, idc: u8, type_: u8) -> NaluWriterResult<()> {
        self.0.flush()?;
        self.0.inner_mut().write_header(idc, type_)?;
        Ok(())
    }

    /// Writes `rbsp_trailing_bits()`: a stop bit and zero bits up to the byte boundary.
    pub fn write_trailing_bits(&mut self) -> NaluWriterResult<()> {
        self.write_f(1, true)?;

        while !self.aligned() {
            self.write_f(1, false)?;
        }

        Ok(())
    }

    /// Returns `true` if next bits will be aligned to 8
    pub fn aligned(&self) -> bool {
        !self.0.has_data_pending()
    }

    /// Number of meaningful bits written so far, start code and emulation prevention bytes
    /// included.
    pub fn bit_len(&self) -> usize {
        self.0.inner().emitted * 8 + self.0.pending_bits()
    }

    /// Outputs the pending bits padded with zeros.
    pub fn flush(&mut self) -> NaluWriterResult<()> {
        self.0.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use bitreader::BitReader;

    use super::*;

    /// Minimal `ue(v)` decoder.
    pub(crate) fn read_ue(reader: &mut BitReader) -> u32 {
        let mut zeros = 0;
        while !reader.read_bool().unwrap() {
            zeros += 1;
        }

        if zeros == 0 {
            return 0;
        }

        let rest = reader.read_u32(zeros).unwrap();
        ((1u64 << zeros) - 1 + rest as u64) as u32
    }

    /// Minimal `se(v)` decoder.
    pub(crate) fn read_se(reader: &mut BitReader) -> i32 {
        let code_num = read_ue(reader) as i64;
        if code_num % 2 == 1 {
            ((code_num + 1) / 2) as i32
        } else {
            -(code_num / 2) as i32
        }
    }

    #[test]
    fn simple_bits() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, false);
            for bit in [true, false, false, false, true, true, true, true] {
                writer.write_f(1, bit).unwrap();
            }
        }
        assert_eq!(buf, vec![0b10001111u8]);
    }

    #[test]
    fn simple_first_few_ue() {
        fn single_ue(value: u32) -> Vec<u8> {
            let mut buf = Vec::<u8>::new();
            {
                let mut writer = NaluWriter::new(&mut buf, false);
                writer.write_ue(value).unwrap();
            }
            buf
        }

        assert_eq!(single_ue(0), vec![0b10000000u8]);
        assert_eq!(single_ue(1), vec![0b01000000u8]);
        assert_eq!(single_ue(2), vec![0b01100000u8]);
        assert_eq!(single_ue(3), vec![0b00100000u8]);
        assert_eq!(single_ue(4), vec![0b00101000u8]);
        assert_eq!(single_ue(5), vec![0b00110000u8]);
        assert_eq!(single_ue(6), vec![0b00111000u8]);
        assert_eq!(single_ue(7), vec![0b00010000u8]);
        assert_eq!(single_ue(8), vec![0b00010010u8]);
        assert_eq!(single_ue(9), vec![0b00010100u8]);
    }

    #[test]
    fn ue_overflow() {
        let mut buf = Vec::<u8>::new();
        let mut writer = NaluWriter::new(&mut buf, false);
        assert!(matches!(
            writer.write_ue(u32::MAX),
            Err(NaluWriterError::Overflow)
        ));
        assert!(matches!(
            writer.write_se(i32::MIN),
            Err(NaluWriterError::Overflow)
        ));
    }

    #[test]
    fn ue_round_trip() {
        const MAX: u32 = 1 << 20;
        const CHUNK: u32 = 1 << 14;

        for start in (0..MAX).step_by(CHUNK as usize) {
            let mut buf = Vec::<u8>::new();
            {
                let mut writer = NaluWriter::new(&mut buf, false);
                for value in start..start + CHUNK {
                    writer.write_ue(value).unwrap();
                }
            }

            let mut reader = BitReader::new(&buf);
            for value in start..start + CHUNK {
                assert_eq!(read_ue(&mut reader), value);
            }
        }
    }

    #[test]
    fn writer_reader() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, false);
            writer.write_ue(10u32).unwrap();
            writer.write_se(-42).unwrap();
            writer.write_se(3).unwrap();
            writer.write_ue(5u32).unwrap();
            writer.write_se(30).unwrap();
            writer.write_ue(100u32).unwrap();
            writer.write_se(-402).unwrap();
            writer.write_ue(50u32).unwrap();
        }

        let mut reader = BitReader::new(&buf);

        assert_eq!(read_ue(&mut reader), 10);
        assert_eq!(read_se(&mut reader), -42);
        assert_eq!(read_se(&mut reader), 3);
        assert_eq!(read_ue(&mut reader), 5);
        assert_eq!(read_se(&mut reader), 30);
        assert_eq!(read_ue(&mut reader), 100);
        assert_eq!(read_se(&mut reader), -402);
        assert_eq!(read_ue(&mut reader), 50);
    }

    #[test]
    fn writer_emulation_prevention() {
        fn test(input: &[u8], bitstream: &[u8]) {
            let mut buf = Vec::<u8>::new();
            {
                let mut writer = NaluWriter::new(&mut buf, true);
                for byte in input {
                    writer.write_f(8, *byte).unwrap();
                }
            }
            assert_eq!(buf, bitstream);
        }

        test(&[0x00, 0x00, 0x00], &[0x00, 0x00, 0x03, 0x00]);
        test(&[0x00, 0x00, 0x01], &[0x00, 0x00, 0x03, 0x01]);
        test(&[0x00, 0x00, 0x02], &[0x00, 0x00, 0x03, 0x02]);
        test(&[0x00, 0x00, 0x03], &[0x00, 0x00, 0x03, 0x03]);
        test(&[0x00, 0x00, 0x04], &[0x00, 0x00, 0x04]);

        test(&[0x00, 0x00, 0x00, 0x00], &[0x00, 0x00, 0x03, 0x00, 0x00]);
        test(&[0x00, 0x00, 0x00, 0x01], &[0x00, 0x00, 0x03, 0x00, 0x01]);
        test(
            &[0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x00],
        );
    }

    #[test]
    fn header_and_bit_len() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, true);
            writer.write_header(3, 7).unwrap();
            assert_eq!(writer.bit_len(), 40);

            writer.write_f(8, 0u8).unwrap();
            writer.write_f(8, 0u8).unwrap();
            writer.write_f(3, 0u8).unwrap();
            // 0x00 0x00 0x03 emulation byte is not yet needed, the third byte is still pending
            assert_eq!(writer.bit_len(), 40 + 19);
            writer.write_f(5, 1u8).unwrap();
            assert_eq!(writer.bit_len(), 40 + 32);
        }

        assert_eq!(buf, [0x00, 0x00, 0x00, 0x01, 0x67, 0x00, 0x00, 0x03, 0x01]);
    }
}
