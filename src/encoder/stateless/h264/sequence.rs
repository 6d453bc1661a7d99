// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Resolution of an [`EncoderConfig`] into the immutable parameters of a coded sequence.

use log::debug;

use crate::codec::h264::levels::LevelLimits;
use crate::codec::h264::levels::LEVEL_LIMITS;
use crate::codec::h264::syntax::Level;
use crate::codec::h264::syntax::Profile;
use crate::codec::h264::syntax::MB_SIZE;
use crate::encoder::h264::ConfigResult;
use crate::encoder::h264::EncoderConfig;
use crate::encoder::h264::EntryPoint;
use crate::encoder::h264::PredictionType;
use crate::encoder::stateless::h264::context::ContextInfo;
use crate::encoder::stateless::h264::gop::resolve_prediction_type;
use crate::encoder::stateless::h264::gop::GopParams;
use crate::encoder::stateless::h264::negotiate::derive_level;
use crate::encoder::stateless::h264::negotiate::ensure_hw_profile;
use crate::encoder::stateless::h264::negotiate::max_level;
use crate::encoder::stateless::h264::negotiate::negotiate;
use crate::encoder::stateless::h264::negotiate::HardwareCaps;
use crate::encoder::stateless::h264::negotiate::ToolSet;
use crate::encoder::stateless::h264::rate_control::target_bitrate;
use crate::encoder::stateless::h264::rate_control::HrdBudget;
use crate::encoder::stateless::h264::rate_control::QpParams;
use crate::encoder::stateless::h264::rate_control::RateControlParams;
use crate::encoder::RateControl;
use crate::Fraction;
use crate::Resolution;

/// Every parameter of a coded sequence, resolved against the hardware.
#[derive(Clone, Debug)]
pub struct SequenceParams {
    /// Profile signalled in the stream.
    pub profile: Profile,
    /// Profile the hardware encodes with, able to decode [`Self::profile`] streams.
    pub hw_profile: Profile,
    pub entry_point: EntryPoint,
    pub level: &'static LevelLimits,
    /// Coding tools left after negotiation.
    pub tools: ToolSet,
    pub gop: GopParams,

    pub resolution: Resolution,
    pub mb_width: u32,
    pub mb_height: u32,
    pub framerate: Fraction,
    pub pixel_aspect_ratio: Fraction,

    pub rate_control: RateControl,
    /// Target bitrate in kbit/s, zero in constant QP mode.
    pub bitrate_kbps: u32,
    pub hrd: HrdBudget,
    /// CPB length in milliseconds.
    pub cpb_length: u32,
    pub qp: QpParams,
    pub rate_control_params: RateControlParams,

    pub context: ContextInfo,
    /// view_id of every coded view.
    pub view_ids: Vec<u16>,
    pub use_aud: bool,
}

impl SequenceParams {
    pub fn mb_count(&self) -> u32 {
        self.mb_width * self.mb_height
    }

    pub fn num_views(&self) -> usize {
        self.view_ids.len()
    }

    pub fn is_mvc(&self) -> bool {
        self.num_views() > 1
    }

    /// Level 3 and above require `direct_8x8_inference_flag` (A.3.3).
    pub fn direct_8x8_inference(&self) -> bool {
        let position = |level: Level| LEVEL_LIMITS.iter().position(|l| l.level == level);
        position(self.level.level) >= position(Level::L3)
    }

    /// True when the stream carries HRD parameters and the timing SEI.
    pub fn has_hrd(&self) -> bool {
        self.rate_control.has_hrd() && self.hrd.bitrate_bits > 0
    }
}

/// Resolves `config` against the capabilities `caps` of the backend.
pub fn derive_sequence(config: &EncoderConfig, caps: &HardwareCaps) -> ConfigResult<SequenceParams> {
    config.validate()?;

    let mbs = config.resolution.in_blocks(MB_SIZE);
    let mb_count = mbs.width * mbs.height;

    let prediction_type =
        resolve_prediction_type(config.prediction_type, config.temporal_levels, config.num_bframes);

    let mut requested = ToolSet {
        use_cabac: config.use_cabac,
        use_dct8x8: config.use_dct8x8,
        num_bframes: config.num_bframes,
        num_views: config.num_views,
    };

    if prediction_type != PredictionType::Default {
        if requested.num_views > 1 {
            log::warn!("MVC is not supported with hierarchical prediction, encoding one view");
        }
        requested.num_views = 1;
    }
    if prediction_type == PredictionType::HierarchicalB {
        requested.num_bframes = requested.num_bframes.max(1);
    }

    let ceiling = config
        .max_profile_idc
        .map_or(caps.max_profile_idc, |user| user.min(caps.max_profile_idc));
    let requested = requested.tuned(config.tune, ceiling);

    let (profile, tools) = negotiate(requested, caps.max_profile_idc, config.max_profile_idc)?;
    let hw_profile = ensure_hw_profile(profile, config.entry_point, caps)?;

    let bitrate_kbps = target_bitrate(
        &config.rate_control,
        mb_count,
        config.framerate,
        tools.use_cabac,
        tools.use_dct8x8,
    );
    let hrd = HrdBudget::new(bitrate_kbps, config.cpb_length);

    let derived = derive_level(
        profile,
        mbs.width,
        mbs.height,
        tools.num_bframes,
        config.framerate,
        hrd.bitrate_bits,
        hrd.cpb_bits,
    )?;
    let level = max_level(derived, config.level);

    let gop = GopParams::derive(config, &tools, mb_count, caps)?;

    let qp = QpParams::new(
        config.effective_init_qp() as u8,
        config.min_qp,
        config.max_qp,
        config.qp_ip,
        config.qp_ib,
        config.rate_control.is_constant_quality(),
    );
    let rate_control_params = RateControlParams::new(&hrd, config.cpb_length, &qp);

    let context = ContextInfo::new(
        hw_profile,
        config.entry_point,
        config.resolution,
        &gop,
        config.compliance_mode,
        level.min_cr,
    );

    let mut view_ids = config.effective_view_ids();
    view_ids.truncate(gop.num_views as usize);

    debug!(
        "sequence: profile {} (hw {}), level {:?}, {}x{} MBs, bitrate {} kbps, cpb {} bits, {:?}",
        profile,
        hw_profile,
        level.level,
        mbs.width,
        mbs.height,
        bitrate_kbps,
        hrd.cpb_bits,
        gop.prediction_type
    );

    Ok(SequenceParams {
        profile,
        hw_profile,
        entry_point: config.entry_point,
        level,
        tools,
        gop,
        resolution: config.resolution,
        mb_width: mbs.width,
        mb_height: mbs.height,
        framerate: config.framerate,
        pixel_aspect_ratio: config.pixel_aspect_ratio,
        rate_control: config.rate_control.clone(),
        bitrate_kbps,
        hrd,
        cpb_length: config.cpb_length,
        qp,
        rate_control_params,
        context,
        view_ids,
        use_aud: config.use_aud,
    })
}
