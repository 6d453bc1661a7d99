// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parameter sets, slice headers and SEI of the coded stream, and their packing into
//! [`PackedHeader`]s for the backend.

use std::rc::Rc;

use crate::codec::h264::synthesizer::Synthesizer;
use crate::codec::h264::synthesizer::SynthesizerResult;
use crate::codec::h264::syntax::nal_ref_idc;
use crate::codec::h264::syntax::AccessUnitDelimiter;
use crate::codec::h264::syntax::BufferingPeriod;
use crate::codec::h264::syntax::NaluHeaderMvcExtension;
use crate::codec::h264::syntax::NaluType;
use crate::codec::h264::syntax::PicTiming;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::PpsBuilder;
use crate::codec::h264::syntax::PrefixNalu;
use crate::codec::h264::syntax::Profile;
use crate::codec::h264::syntax::Sei;
use crate::codec::h264::syntax::SeiMessage;
use crate::codec::h264::syntax::Slice;
use crate::codec::h264::syntax::SliceHeaderBuilder;
use crate::codec::h264::syntax::SliceType;
use crate::codec::h264::syntax::Sps;
use crate::codec::h264::syntax::SpsBuilder;
use crate::codec::h264::syntax::SubsetSps;
use crate::codec::h264::syntax::HRD_DELAY_LENGTH;
use crate::encoder::h264::PredictionType;
use crate::encoder::stateless::h264::references::RefLists;
use crate::encoder::stateless::h264::reorder::PictureInfo;
use crate::encoder::stateless::h264::sequence::SequenceParams;
use crate::encoder::stateless::EncodeResult;
use crate::encoder::PackedHeader;
use crate::encoder::PackedHeaderType;
use crate::encoder::RateControl;

/// Mask of the 24 bit delay fields of the timing SEI.
const HRD_DELAY_MASK: u32 = (1 << HRD_DELAY_LENGTH) - 1;

/// Deblocking filter offsets of every slice.
const SLICE_ALPHA_C0_OFFSET_DIV2: i8 = 2;
const SLICE_BETA_OFFSET_DIV2: i8 = 2;

fn clamp_u16(value: u32) -> u16 {
    value.min(u16::MAX as u32) as u16
}

fn sps_builder(seq: &SequenceParams, profile: Profile, sps_id: u8) -> SpsBuilder {
    let gop = &seq.gop;

    let mut builder = SpsBuilder::new()
        .seq_parameter_set_id(sps_id)
        .profile(profile)
        .level(seq.level.level)
        .chroma_format_idc(1)
        .resolution(seq.resolution)
        .max_num_ref_frames(gop.max_ref_frames.min(u8::MAX as u32) as u8)
        .direct_8x8_inference_flag(seq.direct_8x8_inference())
        .log2_max_frame_num(gop.log2_max_frame_num)
        .pic_order_cnt_type(0)
        .log2_max_pic_order_cnt_lsb(gop.log2_max_pic_order_cnt)
        .sar_resolution(
            clamp_u16(seq.pixel_aspect_ratio.num),
            clamp_u16(seq.pixel_aspect_ratio.den),
        );

    if seq.hrd.bitrate_bits > 0 {
        let cbr = matches!(seq.rate_control, RateControl::ConstantBitrate(_));
        builder = builder.nal_hrd_parameters(seq.hrd.bitrate_bits, seq.hrd.cpb_bits, cbr);
    }

    builder.pic_struct_present_flag(true)
}

/// SPS of the base view. The base view of an MVC stream is signalled as High profile.
pub fn build_sps(seq: &SequenceParams) -> Rc<Sps> {
    let profile = if seq.profile.is_mvc() {
        Profile::High
    } else {
        seq.profile
    };

    // Two fields per frame.
    sps_builder(seq, profile, 0)
        .timing_info(seq.framerate.den, seq.framerate.num.saturating_mul(2), true)
        .build()
}

/// Subset SPS shared by the non-base views. Carries no timing information (H.7.4.2.1.1).
pub fn build_subset_sps(seq: &SequenceParams) -> SubsetSps {
    SubsetSps {
        sps: sps_builder(seq, seq.profile, 1).build(),
        view_ids: seq.view_ids.clone(),
    }
}

/// PPS of the view `view_idx`, referencing `sps`.
pub fn build_pps(seq: &SequenceParams, sps: Rc<Sps>, view_idx: usize) -> Rc<Pps> {
    let sps_id = sps.seq_parameter_set_id;

    PpsBuilder::new(sps)
        .pic_parameter_set_id(view_idx as u8)
        .seq_parameter_set_id(sps_id)
        .entropy_coding_mode_flag(seq.tools.use_cabac)
        .pic_init_qp(seq.qp.qp_i)
        .num_ref_idx_l0_default_active(seq.gop.max_reflist0_count as u8)
        .num_ref_idx_l1_default_active(seq.gop.max_reflist1_count as u8)
        .transform_8x8_mode_flag(seq.tools.use_dct8x8)
        .deblocking_filter_control_present_flag(true)
        .build()
}

/// Parameter sets of one view.
#[derive(Clone, Debug)]
pub struct ViewHeaders {
    pub view_idx: usize,
    pub view_id: u16,
    /// SPS of the base view, also referenced by the non-base views' subset SPS.
    pub sps: Rc<Sps>,
    /// Present for non-base views.
    pub subset_sps: Option<SubsetSps>,
    pub pps: Rc<Pps>,
}

impl ViewHeaders {
    pub fn new(seq: &SequenceParams, view_idx: usize) -> Self {
        let sps = build_sps(seq);
        let view_id = seq.view_ids.get(view_idx).copied().unwrap_or(view_idx as u16);

        let (subset_sps, pps) = if view_idx > 0 {
            let subset_sps = build_subset_sps(seq);
            let pps = build_pps(seq, Rc::clone(&subset_sps.sps), view_idx);
            (Some(subset_sps), pps)
        } else {
            let pps = build_pps(seq, Rc::clone(&sps), view_idx);
            (None, pps)
        };

        Self {
            view_idx,
            view_id,
            sps,
            subset_sps,
            pps,
        }
    }

    /// Parameter set of the view's own sequence: the SPS for the base view, the subset SPS
    /// otherwise.
    pub fn active_sps(&self) -> &Rc<Sps> {
        match &self.subset_sps {
            Some(subset) => &subset.sps,
            None => &self.sps,
        }
    }
}

/// `nal_ref_idc` of the slices of `pic`.
pub fn slice_nal_ref_idc(pic: &PictureInfo) -> u8 {
    match pic.type_ {
        SliceType::I => nal_ref_idc::HIGH,
        SliceType::P if pic.is_reference => nal_ref_idc::MEDIUM,
        SliceType::B if pic.is_reference => nal_ref_idc::LOW,
        _ => nal_ref_idc::NONE,
    }
}

fn mvc_extension(pic: &PictureInfo, view_id: u16) -> NaluHeaderMvcExtension {
    NaluHeaderMvcExtension {
        non_idr_flag: !pic.is_idr,
        priority_id: 0,
        view_id,
        temporal_id: 0,
        anchor_pic_flag: pic.type_.is_i(),
        inter_view_flag: false,
    }
}

/// Splits `mb_count` macroblocks into `num_slices` ranges of `(first_mb, num_mbs)`. The
/// remainder is spread over the first slices.
pub fn slice_ranges(mb_count: u32, num_slices: u32) -> Vec<(u32, u32)> {
    let num_slices = num_slices.clamp(1, mb_count.max(1));
    let slice_mbs = mb_count / num_slices;
    let mut remainder = mb_count % num_slices;

    let mut first_mb = 0;
    (0..num_slices)
        .map(|_| {
            let mut num_mbs = slice_mbs;
            if remainder > 0 {
                num_mbs += 1;
                remainder -= 1;
            }

            let range = (first_mb, num_mbs);
            first_mb += num_mbs;
            range
        })
        .collect()
}

/// A slice to encode: its NAL unit header and slice header, and the macroblocks it covers.
#[derive(Clone, Debug)]
pub struct SliceParams {
    pub slice: Slice,
    pub macroblock_address: u32,
    pub num_macroblocks: u32,
}

/// Builds the slices of `pic`, coded with `lists`.
pub fn build_slices<R>(
    seq: &SequenceParams,
    view: &ViewHeaders,
    pic: &PictureInfo,
    lists: &RefLists<'_, R>,
) -> Vec<SliceParams> {
    let nal_ref_idc = slice_nal_ref_idc(pic);
    let hierarchical = seq.gop.prediction_type != PredictionType::Default;

    let (nalu_type, mvc_extension) = if view.view_idx > 0 {
        (NaluType::SliceExt, Some(mvc_extension(pic, view.view_id)))
    } else if pic.is_idr {
        (NaluType::SliceIdr, None)
    } else {
        (NaluType::Slice, None)
    };

    let num_l0 = if pic.type_.is_i() { 0 } else { lists.list0.len() };
    let num_l1 = if pic.type_.is_b() { lists.list1.len() } else { 0 };

    slice_ranges(seq.mb_count(), seq.gop.num_slices)
        .into_iter()
        .map(|(first_mb, num_mbs)| {
            let mut builder = SliceHeaderBuilder::new(&view.pps)
                .slice_type(pic.type_)
                .first_mb_in_slice(first_mb)
                .frame_num(pic.frame_num as u16)
                .pic_order_cnt_lsb(pic.poc as u16)
                .idr_pic_id(pic.idr_pic_id)
                .direct_spatial_mv_pred_flag(true)
                .num_ref_idx_active_override_flag(num_l0 > 0 || num_l1 > 0)
                .num_ref_idx_l0_active_minus1(num_l0.saturating_sub(1) as u8)
                .num_ref_idx_l1_active_minus1(num_l1.saturating_sub(1) as u8)
                .cabac_init_idc(0)
                .slice_qp_delta(seq.qp.slice_qp_delta(pic.type_))
                .deblocking_filter(0, SLICE_ALPHA_C0_OFFSET_DIV2, SLICE_BETA_OFFSET_DIV2);

            // The default list order already starts with the nearest reference.
            if hierarchical && num_l0 > 0 && lists.abs_diff_pic_num_l0 > 1 {
                builder = builder.ref_pic_list_modification_l0(lists.abs_diff_pic_num_l0);
            }

            if seq.gop.prediction_type == PredictionType::HierarchicalB
                && num_l1 > 0
                && lists.abs_diff_pic_num_l1 > 1
            {
                builder = builder.ref_pic_list_modification_l1(lists.abs_diff_pic_num_l1);
            }

            SliceParams {
                slice: Slice {
                    nal_ref_idc,
                    nalu_type,
                    mvc_extension,
                    header: builder.build(),
                    pps: Rc::clone(&view.pps),
                },
                macroblock_address: first_mb,
                num_macroblocks: num_mbs,
            }
        })
        .collect()
}

/// Prefix NAL unit preceding every base view slice of an MVC stream.
pub fn build_prefix_nalu(pic: &PictureInfo, view_id: u16) -> PrefixNalu {
    PrefixNalu {
        nal_ref_idc: slice_nal_ref_idc(pic),
        mvc_extension: mvc_extension(pic, view_id),
    }
}

pub fn build_aud(pic: &PictureInfo) -> AccessUnitDelimiter {
    let primary_pic_type = match pic.type_ {
        SliceType::I | SliceType::Si => 0,
        SliceType::P | SliceType::Sp => 1,
        SliceType::B => 2,
    };

    AccessUnitDelimiter { primary_pic_type }
}

/// Buffering period message. Decoding starts once the CPB is half full.
pub fn build_buffering_period(seq: &SequenceParams, sps_id: u8) -> BufferingPeriod {
    BufferingPeriod {
        seq_parameter_set_id: sps_id,
        // (cpb_length / 2) * 90000 / 1000
        initial_cpb_removal_delay: seq.cpb_length.saturating_mul(45) & HRD_DELAY_MASK,
        initial_cpb_removal_delay_offset: 0,
        delay_length: HRD_DELAY_LENGTH,
    }
}

/// Picture timing message of the `frame_count`-th picture since the last IDR.
///
/// A frame lasts two clock ticks. The removal delay has one frame of tolerance on top of the
/// picture position.
pub fn build_pic_timing(pic: &PictureInfo, frame_count: u32, pic_struct_present: bool) -> PicTiming {
    let cpb_removal_delay = frame_count.wrapping_mul(2).wrapping_add(2) & HRD_DELAY_MASK;
    let dpb_output_delay = if pic.type_.is_b() {
        0
    } else {
        pic.poc.wrapping_sub(frame_count.wrapping_mul(2)) & HRD_DELAY_MASK
    };

    PicTiming {
        cpb_removal_delay,
        dpb_output_delay,
        cpb_removal_delay_length: HRD_DELAY_LENGTH,
        dpb_output_delay_length: HRD_DELAY_LENGTH,
        pic_struct_present,
        pic_struct: 0,
    }
}

/// Timing SEI of `pic`. IDR pictures also start a buffering period.
pub fn build_sei(seq: &SequenceParams, sps: &Sps, pic: &PictureInfo, frame_count: u32) -> Sei {
    let mut messages = Vec::with_capacity(2);

    if pic.is_idr {
        messages.push(SeiMessage::BufferingPeriod(build_buffering_period(
            seq,
            sps.seq_parameter_set_id,
        )));
    }

    messages.push(SeiMessage::PicTiming(build_pic_timing(
        pic,
        frame_count,
        sps.vui_parameters.pic_struct_present_flag,
    )));

    Sei { messages }
}

/// Synthesizes a NAL unit into a scratch buffer. Nothing is returned unless the whole unit was
/// written.
pub(crate) fn pack<F>(header_type: PackedHeaderType, synthesize: F) -> EncodeResult<PackedHeader>
where
    F: FnOnce(&mut Vec<u8>) -> SynthesizerResult<usize>,
{
    let mut data = Vec::new();
    let bit_len = synthesize(&mut data)?;

    Ok(PackedHeader::new(header_type, data, bit_len))
}

pub fn pack_sps(sps: &Sps) -> EncodeResult<PackedHeader> {
    pack(PackedHeaderType::Sequence, |w| {
        Synthesizer::<Sps, _>::synthesize(nal_ref_idc::HIGH, sps, w, true)
    })
}

pub fn pack_subset_sps(subset_sps: &SubsetSps) -> EncodeResult<PackedHeader> {
    pack(PackedHeaderType::Sequence, |w| {
        Synthesizer::<SubsetSps, _>::synthesize(subset_sps, w, true)
    })
}

pub fn pack_pps(pps: &Pps) -> EncodeResult<PackedHeader> {
    pack(PackedHeaderType::Picture, |w| {
        Synthesizer::<Pps, _>::synthesize(nal_ref_idc::HIGH, pps, w, true)
    })
}

pub fn pack_slice(slice: &Slice) -> EncodeResult<PackedHeader> {
    pack(PackedHeaderType::Slice, |w| {
        Synthesizer::<Slice, _>::synthesize(slice, w, true)
    })
}

pub fn pack_prefix_nalu(prefix: &PrefixNalu) -> EncodeResult<PackedHeader> {
    pack(PackedHeaderType::RawData, |w| {
        Synthesizer::<PrefixNalu, _>::synthesize(prefix, w, true)
    })
}

pub fn pack_aud(aud: &AccessUnitDelimiter) -> EncodeResult<PackedHeader> {
    pack(PackedHeaderType::RawData, |w| {
        Synthesizer::<AccessUnitDelimiter, _>::synthesize(aud, w, true)
    })
}

pub fn pack_sei(sei: &Sei) -> EncodeResult<PackedHeader> {
    pack(PackedHeaderType::Sei, |w| {
        Synthesizer::<Sei, _>::synthesize(sei, w, true)
    })
}
