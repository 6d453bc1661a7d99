// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod h264;
pub mod stateless;

use bytes::Bytes;

use crate::Resolution;

/// Specifies the encoder operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateControl {
    /// The encoder shall maintain codec specific quality parameter constant (eg. QP for H.264)
    /// disregarding bitrate.
    ConstantQuality(u32),

    /// The encoder shall maintain the constant bitrate, in kbit/s. A default is estimated from
    /// the resolution and coding tools when `None`.
    ConstantBitrate(Option<u32>),

    /// The encoder shall keep the average bitrate, in kbit/s. A default is estimated from the
    /// resolution and coding tools when `None`.
    VariableBitrate(Option<u32>),
}

impl RateControl {
    /// Target bitrate in kbit/s requested by the user, if any.
    pub(crate) fn bitrate_target(&self) -> Option<u32> {
        match self {
            RateControl::ConstantBitrate(target) | RateControl::VariableBitrate(target) => *target,
            RateControl::ConstantQuality(_) => None,
        }
    }

    pub fn is_constant_quality(&self) -> bool {
        matches!(self, RateControl::ConstantQuality(_))
    }

    /// True if the stream is bitrate constrained and thus signals HRD parameters.
    pub fn has_hrd(&self) -> bool {
        !self.is_constant_quality()
    }
}

/// Encoder's input metadata
#[derive(Clone, Debug)]
pub struct FrameMetadata {
    pub timestamp: u64,
    pub display_resolution: Resolution,
    pub force_keyframe: bool,
}

/// Encoder's coded output with contained frame.
pub struct CodedBitstreamBuffer {
    /// [`FrameMetadata`] of the frame that is compressed in [`Self::bitstream`]
    pub metadata: FrameMetadata,

    /// Bitstream with compressed frame together with optionally other compressed control messages
    pub bitstream: Vec<u8>,
}

impl CodedBitstreamBuffer {
    pub fn new(metadata: FrameMetadata, bitstream: Vec<u8>) -> Self {
        Self {
            metadata,
            bitstream,
        }
    }
}

impl From<CodedBitstreamBuffer> for Vec<u8> {
    fn from(value: CodedBitstreamBuffer) -> Self {
        value.bitstream
    }
}

/// Kind of a [`PackedHeader`], mirroring the packed header types of VA-API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedHeaderType {
    Sequence,
    Picture,
    Slice,
    Sei,
    /// Headers the backend passes through untouched, e.g. AUD or MVC prefix NAL units.
    RawData,
}

/// A fully synthesized NAL unit handed over to the backend as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedHeader {
    pub header_type: PackedHeaderType,
    /// Annex B NAL unit, start code included.
    pub data: Bytes,
    /// Length of [`Self::data`] in bits. Slice headers may end in the middle of a byte.
    pub bit_len: usize,
    pub has_emulation_bytes: bool,
}

impl PackedHeader {
    pub fn new(header_type: PackedHeaderType, data: Vec<u8>, bit_len: usize) -> Self {
        Self {
            header_type,
            data: Bytes::from(data),
            bit_len,
            has_emulation_bytes: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_control_helpers() {
        let cqp = RateControl::ConstantQuality(26);
        let cbr = RateControl::ConstantBitrate(Some(2000));
        let vbr = RateControl::VariableBitrate(None);

        assert!(cqp.is_constant_quality());
        assert!(!cqp.has_hrd());
        assert!(cbr.has_hrd() && vbr.has_hrd());

        assert_eq!(cqp.bitrate_target(), None);
        assert_eq!(cbr.bitrate_target(), Some(2000));
        assert_eq!(vbr.bitrate_target(), None);
    }
}
