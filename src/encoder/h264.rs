// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

use crate::codec::h264::levels::MAX_FRAME_SIZE_MBS;
use crate::codec::h264::syntax::Level;
use crate::codec::h264::syntax::MB_SIZE;
use crate::encoder::stateless::h264::negotiate::NegotiationError;
use crate::encoder::stateless::StatelessBackendError;
use crate::encoder::RateControl;
use crate::Fraction;
use crate::Resolution;

/// Largest QP value allowed by H.264 for 8 bit content.
pub const MAX_QP: u8 = 51;

/// Largest number of MVC views.
pub const MAX_VIEWS: u32 = 10;

/// Largest number of temporal layers.
pub const MAX_TEMPORAL_LEVELS: u32 = 4;

/// view_id is a 10 bit field of the MVC NAL unit header extension.
const MAX_VIEW_ID: u16 = 1023;

/// Prediction structure of the coded stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictionType {
    /// I/P/B pictures with `num_bframes` B pictures between anchors.
    #[default]
    Default,
    /// Temporal scalability made of P pictures only.
    HierarchicalP,
    /// Temporal scalability with referenced B pictures.
    HierarchicalB,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComplianceMode {
    /// Coded buffers are sized for the worst case allowed by the standard.
    #[default]
    Strict,
    /// Coded buffers are divided by the level's minimum compression ratio.
    RestrictCodedBufferAlloc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tune {
    #[default]
    None,
    /// Enables every coding tool the profile ceiling allows.
    HighCompression,
}

/// Hardware entry point used to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntryPoint {
    #[default]
    Encode,
    EncodeLowPower,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid resolution {0:?}")]
    InvalidResolution(Resolution),
    #[error("invalid framerate {0:?}")]
    InvalidFramerate(Fraction),
    #[error("invalid QP configuration: init {init}, min {min}, max {max}")]
    InvalidQp { init: u32, min: u8, max: u8 },
    #[error("invalid keyframe period {0}")]
    InvalidKeyframePeriod(u32),
    #[error("invalid number of reference frames {0}")]
    InvalidReferenceCount(u32),
    #[error("invalid number of temporal levels {0}, expected 1 to {MAX_TEMPORAL_LEVELS}")]
    InvalidTemporalLevels(u32),
    #[error("invalid number of views {0}, expected 1 to {MAX_VIEWS}")]
    InvalidViewCount(u32),
    #[error("view ids {0:?} do not describe {1} distinct views")]
    ViewIdsMismatch(Vec<u16>, u32),
    #[error("invalid number of slices {0}")]
    InvalidSliceCount(u32),
    #[error("unsupported chroma_format_idc {0}")]
    UnsupportedChromaFormat(u8),
    #[error("B-frames are not supported by the {0:?} entry point")]
    UnsupportedBFrames(EntryPoint),
    #[error("the configuration cannot change once encoding has started")]
    AlreadyStarted,
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("backend failed to configure: {0}")]
    Backend(#[from] StatelessBackendError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Clone, Debug)]
pub struct EncoderConfig {
    pub resolution: Resolution,
    pub framerate: Fraction,
    /// Signalled as the sample aspect ratio of the VUI.
    pub pixel_aspect_ratio: Fraction,
    pub rate_control: RateControl,

    /// Initial QP. Overridden by the value of [`RateControl::ConstantQuality`].
    pub init_qp: u8,
    pub min_qp: u8,
    pub max_qp: u8,
    /// QP offset of P pictures relative to I pictures, constant QP mode only.
    pub qp_ip: i8,
    /// QP offset of B pictures relative to I pictures, constant QP mode only.
    pub qp_ib: i8,

    /// Distance between two I pictures.
    pub keyframe_period: u32,
    /// Distance between two IDR pictures, never smaller than `keyframe_period`.
    pub idr_period: u32,
    pub num_slices: u32,
    pub num_bframes: u32,
    pub num_ref_frames: u32,
    pub use_cabac: bool,
    pub use_dct8x8: bool,

    pub temporal_levels: u32,
    pub prediction_type: PredictionType,

    /// Length of the CPB, in milliseconds.
    pub cpb_length: u32,

    /// Highest profile_idc a downstream decoder accepts.
    pub max_profile_idc: Option<u8>,
    /// Lowest level to signal. The derived level is used when it is higher.
    pub level: Option<Level>,

    pub num_views: u32,
    /// view_id of every view. Defaults to the view index when empty.
    pub view_ids: Vec<u16>,

    pub compliance_mode: ComplianceMode,
    pub tune: Tune,
    pub entry_point: EntryPoint,
    /// Insert an access unit delimiter in front of every picture.
    pub use_aud: bool,
    pub chroma_format_idc: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        // Artificially encoder configuration with intent to be widely supported.
        Self {
            resolution: Resolution {
                width: 320,
                height: 240,
            },
            framerate: Fraction::new(30, 1),
            pixel_aspect_ratio: Fraction::new(1, 1),
            rate_control: RateControl::ConstantQuality(26),
            init_qp: 26,
            min_qp: 1,
            max_qp: MAX_QP,
            qp_ip: 0,
            qp_ib: 0,
            keyframe_period: 30,
            idr_period: 0,
            num_slices: 1,
            num_bframes: 0,
            num_ref_frames: 1,
            use_cabac: false,
            use_dct8x8: false,
            temporal_levels: 1,
            prediction_type: PredictionType::Default,
            cpb_length: 1500,
            max_profile_idc: None,
            level: None,
            num_views: 1,
            view_ids: Vec::new(),
            compliance_mode: ComplianceMode::Strict,
            tune: Tune::None,
            entry_point: EntryPoint::Encode,
            use_aud: false,
            chroma_format_idc: 1,
        }
    }
}

impl EncoderConfig {
    /// QP of I pictures.
    pub fn effective_init_qp(&self) -> u32 {
        match self.rate_control {
            RateControl::ConstantQuality(qp) => qp,
            _ => self.init_qp as u32,
        }
    }

    /// view_id of every view, falling back to the view index.
    pub fn effective_view_ids(&self) -> Vec<u16> {
        if self.view_ids.is_empty() {
            (0..self.num_views as u16).collect()
        } else {
            self.view_ids.clone()
        }
    }

    /// Rejects malformed values. Values that are merely out of the hardware or profile range are
    /// adjusted later, during negotiation.
    pub fn validate(&self) -> ConfigResult<()> {
        let mbs = self.resolution.in_blocks(MB_SIZE);
        if self.resolution.width == 0
            || self.resolution.height == 0
            || mbs.width as u64 * mbs.height as u64 > MAX_FRAME_SIZE_MBS as u64
        {
            return Err(ConfigError::InvalidResolution(self.resolution));
        }

        if self.framerate.num == 0 || self.framerate.den == 0 {
            return Err(ConfigError::InvalidFramerate(self.framerate));
        }

        let init_qp = self.effective_init_qp();
        if self.min_qp > self.max_qp || self.max_qp > MAX_QP || init_qp > MAX_QP as u32 {
            return Err(ConfigError::InvalidQp {
                init: init_qp,
                min: self.min_qp,
                max: self.max_qp,
            });
        }

        if self.keyframe_period == 0 {
            return Err(ConfigError::InvalidKeyframePeriod(self.keyframe_period));
        }

        if !(1..=16).contains(&self.num_ref_frames) {
            return Err(ConfigError::InvalidReferenceCount(self.num_ref_frames));
        }

        if !(1..=MAX_TEMPORAL_LEVELS).contains(&self.temporal_levels) {
            return Err(ConfigError::InvalidTemporalLevels(self.temporal_levels));
        }

        if !(1..=MAX_VIEWS).contains(&self.num_views) {
            return Err(ConfigError::InvalidViewCount(self.num_views));
        }

        if !self.view_ids.is_empty() {
            let mut sorted = self.view_ids.clone();
            sorted.sort_unstable();
            sorted.dedup();

            if self.view_ids.len() != self.num_views as usize
                || sorted.len() != self.view_ids.len()
                || sorted.iter().any(|id| *id > MAX_VIEW_ID)
            {
                return Err(ConfigError::ViewIdsMismatch(
                    self.view_ids.clone(),
                    self.num_views,
                ));
            }
        }

        if self.num_slices == 0 {
            return Err(ConfigError::InvalidSliceCount(self.num_slices));
        }

        // Only 4:2:0 is produced by the supported profiles.
        if self.chroma_format_idc != 1 {
            return Err(ConfigError::UnsupportedChromaFormat(self.chroma_format_idc));
        }

        Ok(())
    }
}
