// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `AVCDecoderConfigurationRecord` (ISO/IEC 14496-15 5.2.4.1) used as codec data by muxers.

use byteorder::BigEndian;
use byteorder::WriteBytesExt;
use thiserror::Error;

use crate::codec::h264::nalu_writer::START_CODE;

/// NAL unit length fields are 4 bytes long.
const NAL_LENGTH_SIZE: u8 = 4;

#[derive(Error, Debug)]
pub enum CodecDataError {
    #[error("the SPS is too short to hold a profile and a level")]
    InvalidSps,
    #[error("NAL unit of {0} bytes cannot be described by a 16 bit length")]
    NaluTooLarge(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CodecDataResult<T> = Result<T, CodecDataError>;

/// Drops the Annex B start code of `nalu`, if any.
fn strip_start_code(nalu: &[u8]) -> &[u8] {
    if nalu.starts_with(&START_CODE) {
        &nalu[START_CODE.len()..]
    } else if nalu.starts_with(&START_CODE[1..]) {
        &nalu[START_CODE.len() - 1..]
    } else {
        nalu
    }
}

fn write_nalu(out: &mut Vec<u8>, nalu: &[u8]) -> CodecDataResult<()> {
    let len = u16::try_from(nalu.len()).map_err(|_| CodecDataError::NaluTooLarge(nalu.len()))?;
    out.write_u16::<BigEndian>(len)?;
    out.extend_from_slice(nalu);
    Ok(())
}

/// Builds the decoder configuration record out of a single SPS and a single PPS NAL unit, with
/// or without their start codes.
pub fn avc_decoder_configuration_record(sps: &[u8], pps: &[u8]) -> CodecDataResult<Vec<u8>> {
    let sps = strip_start_code(sps);
    let pps = strip_start_code(pps);

    if sps.len() < 4 {
        return Err(CodecDataError::InvalidSps);
    }

    let mut out = Vec::with_capacity(sps.len() + pps.len() + 11);

    out.write_u8(/* configurationVersion */ 1)?;
    // profile_idc, constraint flags and level_idc right after the NAL header.
    out.extend_from_slice(&sps[1..4]);
    out.write_u8(0b1111_1100 | (NAL_LENGTH_SIZE - 1))?;

    out.write_u8(0b1110_0000 | /* numOfSequenceParameterSets */ 1)?;
    write_nalu(&mut out, sps)?;

    out.write_u8(/* numOfPictureParameterSets */ 1)?;
    write_nalu(&mut out, pps)?;

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let sps = [0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x28, 0xac];
        let pps = [0x00, 0x00, 0x01, 0x68, 0xee, 0x38, 0x80];

        let record = avc_decoder_configuration_record(&sps, &pps).unwrap();
        assert_eq!(
            record,
            [
                0x01, 0x64, 0x00, 0x28, 0xff, 0xe1, 0x00, 0x05, 0x67, 0x64, 0x00, 0x28, 0xac, 0x01,
                0x00, 0x04, 0x68, 0xee, 0x38, 0x80
            ]
        );
    }

    #[test]
    fn short_sps() {
        assert!(matches!(
            avc_decoder_configuration_record(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x42], &[0x68]),
            Err(CodecDataError::InvalidSps)
        ));
    }
}
