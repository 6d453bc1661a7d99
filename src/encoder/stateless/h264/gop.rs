// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GOP geometry: picture periods, B-frame count, temporal layers and reference pool sizes.

use crate::encoder::h264::ConfigError;
use crate::encoder::h264::ConfigResult;
use crate::encoder::h264::EncoderConfig;
use crate::encoder::h264::PredictionType;
use crate::encoder::stateless::h264::negotiate::HardwareCaps;
use crate::encoder::stateless::h264::negotiate::ToolSet;

/// Temporal layer count used by hierarchical prediction when none is configured.
const DEFAULT_HIERARCHICAL_LEVELS: u32 = 4;

const MIN_LOG2_MAX_FRAME_NUM: u8 = 4;
const MAX_LOG2_MAX_FRAME_NUM: u8 = 10;

/// Resolves the prediction structure. Temporal scalability in default mode selects a
/// hierarchical structure, B when B-frames are requested.
pub fn resolve_prediction_type(
    prediction_type: PredictionType,
    temporal_levels: u32,
    num_bframes: u32,
) -> PredictionType {
    if temporal_levels > 1 && prediction_type == PredictionType::Default {
        if num_bframes > 0 {
            PredictionType::HierarchicalB
        } else {
            PredictionType::HierarchicalP
        }
    } else {
        prediction_type
    }
}

/// Number of bits needed to represent `value`.
fn bit_length(value: u32) -> u32 {
    u32::BITS - value.leading_zeros()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GopParams {
    pub prediction_type: PredictionType,
    /// Distance between two I pictures.
    pub keyframe_period: u32,
    /// Distance between two IDR pictures.
    pub idr_period: u32,
    /// Distance between two anchor (I or P) pictures, zero for intra only streams.
    pub ip_period: u32,
    pub num_bframes: u32,
    pub num_ref_frames: u32,
    pub num_slices: u32,
    pub num_views: u32,

    pub temporal_levels: u32,
    /// `frame_index` divisor of every temporal layer, empty outside hierarchical prediction.
    pub temporal_level_div: Vec<u32>,

    pub log2_max_frame_num: u8,
    pub log2_max_pic_order_cnt: u8,

    pub max_reflist0_count: u32,
    pub max_reflist1_count: u32,
    /// Capacity of every per-view reference pool.
    pub max_ref_frames: u32,
}

impl GopParams {
    /// Derives the geometry for `config`, with the coding tools resolved by negotiation.
    pub fn derive(
        config: &EncoderConfig,
        tools: &ToolSet,
        mb_count: u32,
        caps: &HardwareCaps,
    ) -> ConfigResult<Self> {
        let mut keyframe_period = config.keyframe_period;
        let mut idr_period = config.idr_period.max(keyframe_period);

        let num_slices = config.num_slices.min(mb_count.div_ceil(2)).max(1);
        let mut num_bframes = tools.num_bframes.min(keyframe_period.div_ceil(2));
        let mut num_views = tools.num_views;

        let prediction_type =
            resolve_prediction_type(config.prediction_type, config.temporal_levels, num_bframes);

        if (num_bframes > 0 || prediction_type == PredictionType::HierarchicalB)
            && caps.max_reflist1_count < 1
        {
            return Err(ConfigError::UnsupportedBFrames(config.entry_point));
        }

        let mut num_ref_frames = config.num_ref_frames.min(caps.max_reflist0_count.max(1));
        if num_ref_frames < config.num_ref_frames {
            log::warn!("lowering the number of reference frames to {}", num_ref_frames);
        }

        let log2_max_frame_num = (bit_length(idr_period) as u8)
            .clamp(MIN_LOG2_MAX_FRAME_NUM, MAX_LOG2_MAX_FRAME_NUM);
        let log2_max_pic_order_cnt = log2_max_frame_num + 1;

        let mut temporal_levels = config.temporal_levels;
        let mut temporal_level_div = Vec::new();
        let ip_period;
        let max_reflist0_count;
        let max_reflist1_count;
        let max_ref_frames;

        if prediction_type == PredictionType::Default {
            ip_period = if keyframe_period > 1 {
                1 + num_bframes
            } else {
                0
            };

            max_reflist0_count = num_ref_frames;
            max_reflist1_count = (num_bframes > 0) as u32;
            max_ref_frames = max_reflist0_count + max_reflist1_count;
        } else {
            if temporal_levels <= 1 {
                temporal_levels = DEFAULT_HIERARCHICAL_LEVELS;
            }

            ip_period = 1 << (temporal_levels - 1);
            idr_period = idr_period.next_multiple_of(ip_period);
            keyframe_period = idr_period;

            if num_views > 1 {
                log::warn!("disabling MVC for hierarchical prediction");
                num_views = 1;
            }

            num_bframes = match prediction_type {
                PredictionType::HierarchicalB => ip_period - 1,
                _ => 0,
            };

            max_ref_frames = temporal_levels * temporal_levels / 2 + (num_bframes > 0) as u32;
            max_reflist0_count = 1;
            max_reflist1_count = (num_bframes > 0) as u32;
            num_ref_frames = max_ref_frames;

            let mut div = ip_period;
            for _ in 0..temporal_levels {
                temporal_level_div.push(div);
                div >>= 1;
            }
        }

        Ok(Self {
            prediction_type,
            keyframe_period,
            idr_period,
            ip_period,
            num_bframes,
            num_ref_frames,
            num_slices,
            num_views,
            temporal_levels,
            temporal_level_div,
            log2_max_frame_num,
            log2_max_pic_order_cnt,
            max_reflist0_count,
            max_reflist1_count,
            max_ref_frames,
        })
    }

    pub fn max_frame_num(&self) -> u32 {
        1 << self.log2_max_frame_num
    }

    pub fn max_pic_order_cnt(&self) -> u32 {
        1 << self.log2_max_pic_order_cnt
    }

    pub fn is_hierarchical(&self) -> bool {
        self.prediction_type != PredictionType::Default
    }

    /// Temporal layer of the picture at `frame_index` within the IDR period.
    pub fn temporal_id(&self, frame_index: u32) -> u8 {
        self.temporal_level_div
            .iter()
            .position(|div| frame_index % div == 0)
            .unwrap_or(0) as u8
    }

    /// True for pictures of the highest temporal layer, which are never referenced.
    pub fn is_temporal_id_max(&self, temporal_id: u8) -> bool {
        temporal_id as u32 + 1 == self.temporal_levels
    }
}
