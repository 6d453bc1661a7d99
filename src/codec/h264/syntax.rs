// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Syntax structures of the H.264 headers the encoder produces, together with builders filling
//! them from encoder parameters. [`crate::codec::h264::synthesizer::Synthesizer`] turns them into
//! bits.

use std::rc::Rc;

use enumn::N;

use crate::Resolution;

/// Size of a macroblock in luma samples.
pub const MB_SIZE: u32 = 16;

/// Extended Sample Aspect Ratio - H.264 Table E-1
pub const EXTENDED_SAR: u8 = 255;

#[derive(N, Debug, PartialEq, Eq, Clone, Copy)]
pub enum NaluType {
    Unknown = 0,
    Slice = 1,
    SliceDpa = 2,
    SliceDpb = 3,
    SliceDpc = 4,
    SliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AuDelimiter = 9,
    SeqEnd = 10,
    StreamEnd = 11,
    FillerData = 12,
    SpsExt = 13,
    PrefixUnit = 14,
    SubsetSps = 15,
    DepthSps = 16,
    SliceAux = 19,
    SliceExt = 20,
    SliceDepth = 21,
}

/// `nal_ref_idc` values used by the encoder.
pub mod nal_ref_idc {
    pub const NONE: u8 = 0;
    pub const LOW: u8 = 1;
    pub const MEDIUM: u8 = 2;
    pub const HIGH: u8 = 3;
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
/// See table 7-6 in the specification.
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    /// Whether this is a P slice. See table 7-6 in the specification.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether this is a B slice. See table 7-6 in the specification.
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether this is an I slice. See table 7-6 in the specification.
    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

/// H.264 profiles known to the encoder. Constrained Baseline shares its `profile_idc` with
/// Baseline and is told apart by the constraint flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Profile {
    ConstrainedBaseline,
    Baseline,
    Main,
    Extended,
    High,
    High10,
    High422P,
    High444,
    MultiviewHigh,
    StereoHigh,
}

impl Profile {
    pub const fn idc(&self) -> u8 {
        match self {
            Profile::ConstrainedBaseline | Profile::Baseline => 66,
            Profile::Main => 77,
            Profile::Extended => 88,
            Profile::High => 100,
            Profile::High10 => 110,
            Profile::High422P => 122,
            Profile::High444 => 244,
            Profile::MultiviewHigh => 118,
            Profile::StereoHigh => 128,
        }
    }

    /// Profiles carrying the chroma format and bit depth fields in the SPS, and the 8x8
    /// transform fields in the PPS.
    pub const fn is_high_tier(&self) -> bool {
        matches!(
            self,
            Profile::High
                | Profile::High10
                | Profile::High422P
                | Profile::High444
                | Profile::MultiviewHigh
                | Profile::StereoHigh
        )
    }

    pub const fn is_mvc(&self) -> bool {
        matches!(self, Profile::MultiviewHigh | Profile::StereoHigh)
    }

    /// `constraint_set0_flag` and `constraint_set1_flag` (A.2.1 and A.2.2).
    pub const fn constraint_flags(&self) -> (bool, bool) {
        match self {
            Profile::ConstrainedBaseline => (true, true),
            Profile::Baseline => (true, false),
            Profile::Main => (false, true),
            _ => (false, false),
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Profile::ConstrainedBaseline => "constrained-baseline",
            Profile::Baseline => "baseline",
            Profile::Main => "main",
            Profile::Extended => "extended",
            Profile::High => "high",
            Profile::High10 => "high-10",
            Profile::High422P => "high-4:2:2",
            Profile::High444 => "high-4:4:4",
            Profile::MultiviewHigh => "multiview-high",
            Profile::StereoHigh => "stereo-high",
        };

        f.write_str(name)
    }
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

/// A H264 Sequence Parameter Set. A syntax structure containing syntax elements
/// that apply to zero or more entire coded video sequences.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    /// Identifies the sequence parameter set that is referred to by the picture
    /// parameter set
    pub seq_parameter_set_id: u8,

    /// Profile to which the coded video sequence conforms
    pub profile_idc: u8,

    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,

    /// Level to which the coded video sequence conforms
    pub level_idc: Level,

    /// Specifies the chroma sampling relative to the luma sampling as specified in clause 6.2.
    pub chroma_format_idc: u8,

    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,

    /// Scaling matrices are not signalled by this encoder, setting the flag makes synthesis fail.
    pub seq_scaling_matrix_present_flag: bool,

    /// Specifies the value of the variable MaxFrameNum that is used in
    /// frame_num related derivations as follows: MaxFrameNum = 2 ^
    /// (log2_max_frame_num_minus4 + 4).
    pub log2_max_frame_num_minus4: u8,

    /// Only type 0 is supported.
    pub pic_order_cnt_type: u8,

    /// MaxPicOrderCntLsb = 2 ^ (log2_max_pic_order_cnt_lsb_minus4 + 4).
    pub log2_max_pic_order_cnt_lsb_minus4: u8,

    /// Maximum number of short-term and long-term reference frames that may be used by the
    /// decoding process for inter prediction.
    pub max_num_ref_frames: u8,

    pub gaps_in_frame_num_value_allowed_flag: bool,

    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,

    /// Interlaced coding is not supported, clearing the flag makes synthesis fail.
    pub frame_mbs_only_flag: bool,

    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,

    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
}

impl Sps {
    pub const fn width_in_mbs(&self) -> u32 {
        self.pic_width_in_mbs_minus1 as u32 + 1
    }

    pub const fn height_in_mbs(&self) -> u32 {
        self.pic_height_in_map_units_minus1 as u32 + 1
    }

    pub const fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    pub const fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }
}

#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Self(Sps {
            frame_mbs_only_flag: true,
            chroma_format_idc: 1,
            ..Default::default()
        })
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    /// Sets `profile_idc` together with the constraint flags the profile implies.
    pub fn profile(mut self, value: Profile) -> Self {
        let (set0, set1) = value.constraint_flags();
        self.0.profile_idc = value.idc();
        self.0.constraint_set0_flag = set0;
        self.0.constraint_set1_flag = set1;
        self
    }

    pub fn level_idc(mut self, value: Level) -> Self {
        self.0.level_idc = value;
        self
    }

    /// Sets the level, signalling level 1b as level 1.1 with `constraint_set3_flag` outside of
    /// the High profiles (A.3.1 and A.3.2).
    pub fn level(mut self, value: Level) -> Self {
        let high_tier = [100, 110, 122, 244, 118, 128].contains(&self.0.profile_idc);
        if value == Level::L1B && !high_tier {
            self.0.level_idc = Level::L1_1;
            self.0.constraint_set3_flag = true;
        } else {
            self.0.level_idc = value;
        }
        self
    }

    pub fn chroma_format_idc(mut self, value: u8) -> Self {
        self.0.chroma_format_idc = value;
        self
    }

    pub fn frame_crop_offsets(mut self, top: u32, bottom: u32, left: u32, right: u32) -> Self {
        self.0.frame_cropping_flag = true;
        self.0.frame_crop_top_offset = top;
        self.0.frame_crop_bottom_offset = bottom;
        self.0.frame_crop_left_offset = left;
        self.0.frame_crop_right_offset = right;
        self
    }

    /// Crops the given amount of luma samples, converted into crop units (H.264 7-19 to 7-22).
    pub fn frame_crop(self, top: u32, bottom: u32, left: u32, right: u32) -> Self {
        // H.264 Table 6-1, indexed by chroma_format_idc
        const SUB_WIDTH_C: [u32; 4] = [1, 2, 2, 1];
        const SUB_HEIGHT_C: [u32; 4] = [1, 2, 1, 1];

        let idc = (self.0.chroma_format_idc as usize).min(3);
        let frame_factor = if self.0.frame_mbs_only_flag { 1 } else { 2 };

        let crop_unit_x = SUB_WIDTH_C[idc];
        let crop_unit_y = SUB_HEIGHT_C[idc] * frame_factor;

        self.frame_crop_offsets(
            top / crop_unit_y,
            bottom / crop_unit_y,
            left / crop_unit_x,
            right / crop_unit_x,
        )
    }

    /// Sets the coded size in macroblocks and crops the padding when `resolution` is not
    /// macroblock aligned.
    pub fn resolution(mut self, resolution: Resolution) -> Self {
        let mbs = resolution.in_blocks(MB_SIZE);

        self.0.pic_width_in_mbs_minus1 = (mbs.width.max(1) - 1) as u16;
        self.0.pic_height_in_map_units_minus1 = (mbs.height.max(1) - 1) as u16;

        let compressed_width = mbs.width * MB_SIZE;
        let compressed_height = mbs.height * MB_SIZE;

        if compressed_width != resolution.width || compressed_height != resolution.height {
            self = self.frame_crop(
                0,
                compressed_height - resolution.height,
                0,
                compressed_width - resolution.width,
            );
        }

        self
    }

    pub fn max_num_ref_frames(mut self, value: u8) -> Self {
        self.0.max_num_ref_frames = value;
        self
    }

    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    pub fn direct_8x8_inference_flag(mut self, value: bool) -> Self {
        self.0.direct_8x8_inference_flag = value;
        self
    }

    pub fn log2_max_frame_num_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_frame_num_minus4 = value;
        self
    }

    pub fn log2_max_frame_num(self, value: u8) -> Self {
        self.log2_max_frame_num_minus4(value.saturating_sub(4))
    }

    pub fn pic_order_cnt_type(mut self, value: u8) -> Self {
        self.0.pic_order_cnt_type = value;
        self
    }

    pub fn log2_max_pic_order_cnt_lsb_minus4(mut self, value: u8) -> Self {
        self.0.log2_max_pic_order_cnt_lsb_minus4 = value;
        self
    }

    pub fn log2_max_pic_order_cnt_lsb(self, value: u8) -> Self {
        self.log2_max_pic_order_cnt_lsb_minus4(value.saturating_sub(4))
    }

    pub fn bit_depth_luma(mut self, value: u8) -> Self {
        self.0.bit_depth_luma_minus8 = value.saturating_sub(8);
        self
    }

    pub fn bit_depth_chroma(mut self, value: u8) -> Self {
        self.0.bit_depth_chroma_minus8 = value.saturating_sub(8);
        self
    }

    pub fn vui_parameters_present(mut self) -> Self {
        if self.0.vui_parameters_present_flag {
            return self;
        }

        self.0.vui_parameters_present_flag = true;
        self.0.vui_parameters = VuiParams::default();
        self
    }

    pub fn aspect_ratio_idc(mut self, value: u8) -> Self {
        self = self.vui_parameters_present();
        self.0.vui_parameters.aspect_ratio_info_present_flag = true;
        self.0.vui_parameters.aspect_ratio_idc = value;
        self
    }

    /// Signals the sample aspect ratio explicitly with [`EXTENDED_SAR`].
    pub fn sar_resolution(mut self, width: u16, height: u16) -> Self {
        self = self.aspect_ratio_idc(EXTENDED_SAR);
        self.0.vui_parameters.sar_width = width;
        self.0.vui_parameters.sar_height = height;
        self
    }

    pub fn timing_info(
        mut self,
        num_units_in_tick: u32,
        time_scale: u32,
        fixed_frame_rate_flag: bool,
    ) -> Self {
        self = self.vui_parameters_present();
        self.0.vui_parameters.timing_info_present_flag = true;
        self.0.vui_parameters.num_units_in_tick = num_units_in_tick;
        self.0.vui_parameters.time_scale = time_scale;
        self.0.vui_parameters.fixed_frame_rate_flag = fixed_frame_rate_flag;
        self
    }

    /// Signals a single-CPB NAL HRD. `bitrate` and `cpb_size` are in bits and must already be
    /// rounded to [`HRD_BITRATE_SCALE`] and [`HRD_CPB_SIZE_SCALE`] granularity.
    pub fn nal_hrd_parameters(mut self, bitrate: u32, cpb_size: u32, cbr: bool) -> Self {
        self = self.vui_parameters_present();

        let vui = &mut self.0.vui_parameters;
        vui.nal_hrd_parameters_present_flag = true;
        vui.nal_hrd_parameters = HrdParams::single_cpb(bitrate, cpb_size, cbr);
        vui.pic_struct_present_flag = true;
        self
    }

    pub fn pic_struct_present_flag(mut self, value: bool) -> Self {
        self = self.vui_parameters_present();
        self.0.vui_parameters.pic_struct_present_flag = value;
        self
    }

    pub fn build(self) -> Rc<Sps> {
        Rc::new(self.0)
    }
}

/// Minimal value of `bit_rate_scale + 6` (E-37), bitrates are expressed in units of 64 bits.
pub const HRD_BITRATE_SCALE: u32 = 6;

/// Minimal value of `cpb_size_scale + 4` (E-38), CPB sizes are expressed in units of 16 bits.
pub const HRD_CPB_SIZE_SCALE: u32 = 4;

/// Length of the delay fields of the HRD and its SEI messages.
pub const HRD_DELAY_LENGTH: u8 = 24;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    /// Plus 1 specifies the number of alternative CPB specifications in the
    /// bitstream. The value of `cpb_cnt_minus1` shall be in the range of 0 to 31,
    /// inclusive
    pub cpb_cnt_minus1: u8,
    /// Together with `bit_rate_value_minus1[ SchedSelIdx ]` specifies the
    /// maximum input bit rate of the SchedSelIdx-th CPB.
    pub bit_rate_scale: u8,
    /// Together with `cpb_size_value_minus1[ SchedSelIdx ]` specifies the CPB
    /// size of the SchedSelIdx-th CPB.
    pub cpb_size_scale: u8,

    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],

    pub initial_cpb_removal_delay_length_minus1: u8,
    pub cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub time_offset_length: u8,
}

impl HrdParams {
    fn single_cpb(bitrate: u32, cpb_size: u32, cbr: bool) -> Self {
        let mut hrd = HrdParams {
            cpb_cnt_minus1: 0,
            bit_rate_scale: 0,
            cpb_size_scale: 0,
            initial_cpb_removal_delay_length_minus1: HRD_DELAY_LENGTH - 1,
            cpb_removal_delay_length_minus1: HRD_DELAY_LENGTH - 1,
            dpb_output_delay_length_minus1: HRD_DELAY_LENGTH - 1,
            time_offset_length: HRD_DELAY_LENGTH - 1,
            ..Default::default()
        };

        hrd.bit_rate_value_minus1[0] = (bitrate >> HRD_BITRATE_SCALE).saturating_sub(1);
        hrd.cpb_size_value_minus1[0] = (cpb_size >> HRD_CPB_SIZE_SCALE).saturating_sub(1);
        hrd.cbr_flag[0] = cbr;
        hrd
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u8,

    /* if aspect_ratio_idc == 255 */
    pub sar_width: u16,
    pub sar_height: u16,

    pub overscan_info_present_flag: bool,
    /* if overscan_info_present_flag */
    pub overscan_appropriate_flag: bool,

    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,

    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u8,
    pub chroma_sample_loc_type_bottom_field: u8,

    pub timing_info_present_flag: bool,
    /* if timing_info_present_flag */
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub fixed_frame_rate_flag: bool,

    pub nal_hrd_parameters_present_flag: bool,
    /* if nal_hrd_parameters_present_flag */
    pub nal_hrd_parameters: HrdParams,
    pub vcl_hrd_parameters_present_flag: bool,
    /* if vcl_hrd_parameters_present_flag */
    pub vcl_hrd_parameters: HrdParams,

    pub low_delay_hrd_flag: bool,

    pub pic_struct_present_flag: bool,

    pub bitstream_restriction_flag: bool,
    /*  if bitstream_restriction_flag */
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_mb_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
    pub max_num_reorder_frames: u32,
    pub max_dec_frame_buffering: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: Default::default(),
            aspect_ratio_idc: Default::default(),
            sar_width: Default::default(),
            sar_height: Default::default(),
            overscan_info_present_flag: Default::default(),
            overscan_appropriate_flag: Default::default(),
            video_signal_type_present_flag: Default::default(),
            video_format: 5,
            video_full_range_flag: Default::default(),
            colour_description_present_flag: Default::default(),
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coefficients: 2,
            chroma_loc_info_present_flag: Default::default(),
            chroma_sample_loc_type_top_field: Default::default(),
            chroma_sample_loc_type_bottom_field: Default::default(),
            timing_info_present_flag: Default::default(),
            num_units_in_tick: Default::default(),
            time_scale: Default::default(),
            fixed_frame_rate_flag: Default::default(),
            nal_hrd_parameters_present_flag: Default::default(),
            nal_hrd_parameters: Default::default(),
            vcl_hrd_parameters_present_flag: Default::default(),
            vcl_hrd_parameters: Default::default(),
            low_delay_hrd_flag: Default::default(),
            pic_struct_present_flag: Default::default(),
            bitstream_restriction_flag: Default::default(),
            motion_vectors_over_pic_boundaries_flag: Default::default(),
            max_bytes_per_pic_denom: Default::default(),
            max_bits_per_mb_denom: Default::default(),
            log2_max_mv_length_horizontal: Default::default(),
            log2_max_mv_length_vertical: Default::default(),
            max_num_reorder_frames: Default::default(),
            max_dec_frame_buffering: Default::default(),
        }
    }
}

/// Subset SPS of a non-base MVC view (H.264 7.3.2.1.3 and G.7.3.2.1.4).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubsetSps {
    /// SPS data, with an MVC `profile_idc`.
    pub sps: Rc<Sps>,

    /// `view_id` of every view, in view order.
    pub view_ids: Vec<u16>,
}

/// A H264 Picture Parameter Set. A syntax structure containing syntax elements
/// that apply to zero or more entire coded pictures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pps {
    /// Identifies the picture parameter set that is referred to in the slice header.
    pub pic_parameter_set_id: u8,

    /// Refers to the active sequence parameter set.
    pub seq_parameter_set_id: u8,

    /// Selects CABAC (set) or CAVLC (unset) entropy coding.
    pub entropy_coding_mode_flag: bool,

    pub bottom_field_pic_order_in_frame_present_flag: bool,

    /// Slice groups are not supported, any value other than 0 makes synthesis fail.
    pub num_slice_groups_minus1: u32,

    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,

    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,

    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,

    pub chroma_qp_index_offset: i8,

    /// When set the slice headers carry the deblocking filter controls.
    pub deblocking_filter_control_present_flag: bool,

    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,

    pub transform_8x8_mode_flag: bool,

    /// Scaling matrices are not signalled by this encoder, setting the flag makes synthesis fail.
    pub pic_scaling_matrix_present_flag: bool,

    pub second_chroma_qp_index_offset: i8,

    /// The SPS referenced by this PPS.
    pub sps: Rc<Sps>,
}

impl Pps {
    pub fn pic_init_qp(&self) -> i32 {
        26 + self.pic_init_qp_minus26 as i32
    }
}

pub struct PpsBuilder(Pps);

impl PpsBuilder {
    pub fn new(sps: Rc<Sps>) -> Self {
        PpsBuilder(Pps {
            pic_parameter_set_id: 0,
            seq_parameter_set_id: sps.seq_parameter_set_id,
            entropy_coding_mode_flag: false,
            bottom_field_pic_order_in_frame_present_flag: false,
            num_slice_groups_minus1: 0,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            transform_8x8_mode_flag: false,
            pic_scaling_matrix_present_flag: false,
            second_chroma_qp_index_offset: 0,
            sps,
        })
    }

    pub fn pic_parameter_set_id(mut self, value: u8) -> Self {
        self.0.pic_parameter_set_id = value;
        self
    }

    pub fn seq_parameter_set_id(mut self, value: u8) -> Self {
        self.0.seq_parameter_set_id = value;
        self
    }

    pub fn entropy_coding_mode_flag(mut self, value: bool) -> Self {
        self.0.entropy_coding_mode_flag = value;
        self
    }

    pub fn pic_init_qp_minus26(mut self, value: i8) -> Self {
        self.0.pic_init_qp_minus26 = value;
        self
    }

    pub fn pic_init_qp(self, value: u8) -> Self {
        self.pic_init_qp_minus26(value as i8 - 26)
    }

    pub fn deblocking_filter_control_present_flag(mut self, value: bool) -> Self {
        self.0.deblocking_filter_control_present_flag = value;
        self
    }

    pub fn transform_8x8_mode_flag(mut self, value: bool) -> Self {
        self.0.transform_8x8_mode_flag = value;
        self
    }

    pub fn num_ref_idx_l0_default_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l0_default_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l0_default_active(self, value: u8) -> Self {
        self.num_ref_idx_l0_default_active_minus1(value.saturating_sub(1))
    }

    pub fn num_ref_idx_l1_default_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l1_default_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l1_default_active(self, value: u8) -> Self {
        self.num_ref_idx_l1_default_active_minus1(value.saturating_sub(1))
    }

    pub fn build(self) -> Rc<Pps> {
        Rc::new(self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    /// 0 subtracts and 1 adds `abs_diff_pic_num_minus1 + 1` to the picture number prediction.
    pub modification_of_pic_nums_idc: u8,
    pub abs_diff_pic_num_minus1: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// Specifies how the previously-decoded pictures in the decoded picture
    /// buffer are treated after decoding of an IDR picture. See Annex C.
    pub no_output_of_prior_pics_flag: bool,

    /// If set, the IDR picture is marked as "used for long-term reference".
    pub long_term_reference_flag: bool,

    /// Only the sliding window marking is produced, setting the flag makes synthesis fail.
    pub adaptive_ref_pic_marking_mode_flag: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// Specifies the address of the first macroblock in the slice.
    pub first_mb_in_slice: u32,

    /// Specifies the coding type of the slice according to Table 7-6.
    pub slice_type: SliceType,

    // Specifies the picture parameter set in use
    pub pic_parameter_set_id: u8,

    /// Used as an identifier for pictures and shall be represented by
    /// `log2_max_frame_num_minus4 + 4` bits in the bitstream.
    pub frame_num: u16,

    /// Identifies an IDR picture. Consecutive IDR access units use different values.
    pub idr_pic_id: u16,

    /// Specifies the picture order count modulo `MaxPicOrderCntLsb`, written with
    /// `log2_max_pic_order_cnt_lsb_minus4 + 4` bits.
    pub pic_order_cnt_lsb: u16,

    /// Specifies the method used in the decoding process to derive motion
    /// vectors and reference indices for inter prediction.
    pub direct_spatial_mv_pred_flag: bool,

    /// If set, `num_ref_idx_l0_active_minus1` is present for P and B slices and
    /// `num_ref_idx_l1_active_minus1` for B slices.
    pub num_ref_idx_active_override_flag: bool,

    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,

    pub ref_pic_list_modification_flag_l0: bool,
    pub ref_pic_list_modification_l0: Vec<RefPicListModification>,

    pub ref_pic_list_modification_flag_l1: bool,
    pub ref_pic_list_modification_l1: Vec<RefPicListModification>,

    /// Decoded reference picture marking, written for reference pictures only.
    pub dec_ref_pic_marking: RefPicMarking,

    /// Specifies the index for determining the initialization table used in the
    /// initialization process for context variables.
    pub cabac_init_idc: u8,

    /// QP of the slice relative to the PPS `pic_init_qp`.
    pub slice_qp_delta: i8,

    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
}

pub struct SliceHeaderBuilder(SliceHeader);

impl SliceHeaderBuilder {
    pub fn new(pps: &Pps) -> Self {
        SliceHeaderBuilder(SliceHeader {
            pic_parameter_set_id: pps.pic_parameter_set_id,
            ..Default::default()
        })
    }

    pub fn slice_type(mut self, type_: SliceType) -> Self {
        self.0.slice_type = type_;
        self
    }

    pub fn first_mb_in_slice(mut self, value: u32) -> Self {
        self.0.first_mb_in_slice = value;
        self
    }

    pub fn frame_num(mut self, value: u16) -> Self {
        self.0.frame_num = value;
        self
    }

    pub fn pic_order_cnt_lsb(mut self, value: u16) -> Self {
        self.0.pic_order_cnt_lsb = value;
        self
    }

    pub fn idr_pic_id(mut self, value: u16) -> Self {
        self.0.idr_pic_id = value;
        self
    }

    pub fn direct_spatial_mv_pred_flag(mut self, value: bool) -> Self {
        self.0.direct_spatial_mv_pred_flag = value;
        self
    }

    pub fn num_ref_idx_active_override_flag(mut self, value: bool) -> Self {
        self.0.num_ref_idx_active_override_flag = value;
        self
    }

    pub fn num_ref_idx_l0_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l0_active_minus1 = value;
        self
    }

    pub fn num_ref_idx_l1_active_minus1(mut self, value: u8) -> Self {
        self.0.num_ref_idx_l1_active_minus1 = value;
        self
    }

    /// Moves the short-term picture `abs_diff` frame numbers below the current one to the head
    /// of list 0.
    pub fn ref_pic_list_modification_l0(mut self, abs_diff: u32) -> Self {
        self.0.ref_pic_list_modification_flag_l0 = true;
        self.0.ref_pic_list_modification_l0 = vec![RefPicListModification {
            modification_of_pic_nums_idc: 0,
            abs_diff_pic_num_minus1: abs_diff.saturating_sub(1),
        }];
        self
    }

    /// Same as [`Self::ref_pic_list_modification_l0`], for list 1.
    pub fn ref_pic_list_modification_l1(mut self, abs_diff: u32) -> Self {
        self.0.ref_pic_list_modification_flag_l1 = true;
        self.0.ref_pic_list_modification_l1 = vec![RefPicListModification {
            modification_of_pic_nums_idc: 0,
            abs_diff_pic_num_minus1: abs_diff.saturating_sub(1),
        }];
        self
    }

    pub fn cabac_init_idc(mut self, value: u8) -> Self {
        self.0.cabac_init_idc = value;
        self
    }

    pub fn slice_qp_delta(mut self, value: i8) -> Self {
        self.0.slice_qp_delta = value;
        self
    }

    pub fn deblocking_filter(mut self, disable_idc: u8, alpha_div2: i8, beta_div2: i8) -> Self {
        self.0.disable_deblocking_filter_idc = disable_idc;
        self.0.slice_alpha_c0_offset_div2 = alpha_div2;
        self.0.slice_beta_offset_div2 = beta_div2;
        self
    }

    pub fn build(self) -> SliceHeader {
        self.0
    }
}

/// `nal_unit_header_mvc_extension()` (H.264 G.7.3.1.1).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeaderMvcExtension {
    pub non_idr_flag: bool,
    pub priority_id: u8,
    pub view_id: u16,
    pub temporal_id: u8,
    pub anchor_pic_flag: bool,
    pub inter_view_flag: bool,
}

/// A coded slice NAL unit header: the NAL header, the optional MVC extension and the slice
/// header, with the parameter sets needed to lay it out.
#[derive(Clone, Debug)]
pub struct Slice {
    pub nal_ref_idc: u8,
    pub nalu_type: NaluType,

    /// Present for [`NaluType::SliceExt`] slices of non-base MVC views.
    pub mvc_extension: Option<NaluHeaderMvcExtension>,

    pub header: SliceHeader,
    pub pps: Rc<Pps>,
}

impl Slice {
    pub fn is_idr(&self) -> bool {
        match self.mvc_extension {
            Some(ext) => !ext.non_idr_flag,
            None => self.nalu_type == NaluType::SliceIdr,
        }
    }
}

/// Prefix NAL unit preceding base view slices of an MVC stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrefixNalu {
    pub nal_ref_idc: u8,
    pub mvc_extension: NaluHeaderMvcExtension,
}

/// Access unit delimiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessUnitDelimiter {
    /// 0 for I, 1 for I/P and 2 for I/P/B slices (Table 7-5).
    pub primary_pic_type: u8,
}

/// Buffering period SEI message (H.264 D.1.2), NAL HRD with a single CPB.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferingPeriod {
    pub seq_parameter_set_id: u8,
    pub initial_cpb_removal_delay: u32,
    pub initial_cpb_removal_delay_offset: u32,
    pub delay_length: u8,
}

/// Picture timing SEI message (H.264 D.1.3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PicTiming {
    pub cpb_removal_delay: u32,
    pub dpb_output_delay: u32,
    pub cpb_removal_delay_length: u8,
    pub dpb_output_delay_length: u8,

    /// `pic_struct_present_flag` of the active VUI.
    pub pic_struct_present: bool,
    pub pic_struct: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeiMessage {
    BufferingPeriod(BufferingPeriod),
    PicTiming(PicTiming),
}

impl SeiMessage {
    pub fn payload_type(&self) -> u32 {
        match self {
            SeiMessage::BufferingPeriod(_) => 0,
            SeiMessage::PicTiming(_) => 1,
        }
    }
}

/// A SEI NAL unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sei {
    pub messages: Vec<SeiMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sps_builder_crop_420() {
        let sps = SpsBuilder::new()
            .chroma_format_idc(1)
            .resolution(Resolution {
                width: 1920,
                height: 1080,
            })
            .build();

        assert_eq!(sps.width_in_mbs(), 120);
        assert_eq!(sps.height_in_mbs(), 68);
        assert!(sps.frame_cropping_flag);
        assert_eq!(sps.frame_crop_bottom_offset, 4);
        assert_eq!(sps.frame_crop_right_offset, 0);
    }

    #[test]
    fn sps_builder_crop_444_and_aligned() {
        let sps = SpsBuilder::new()
            .chroma_format_idc(3)
            .resolution(Resolution {
                width: 100,
                height: 100,
            })
            .build();

        assert_eq!(sps.frame_crop_right_offset, 12);
        assert_eq!(sps.frame_crop_bottom_offset, 12);

        let sps = SpsBuilder::new()
            .resolution(Resolution {
                width: 320,
                height: 240,
            })
            .build();
        assert!(!sps.frame_cropping_flag);
    }

    #[test]
    fn profile_constraint_flags() {
        let sps = SpsBuilder::new()
            .profile(Profile::ConstrainedBaseline)
            .build();
        assert_eq!(sps.profile_idc, 66);
        assert!(sps.constraint_set0_flag && sps.constraint_set1_flag);

        let sps = SpsBuilder::new().profile(Profile::High).build();
        assert_eq!(sps.profile_idc, 100);
        assert!(!sps.constraint_set0_flag && !sps.constraint_set1_flag);
    }

    #[test]
    fn hrd_units() {
        let sps = SpsBuilder::new()
            .nal_hrd_parameters(64 * 1000, 16 * 3000, true)
            .build();
        let hrd = &sps.vui_parameters.nal_hrd_parameters;

        assert!(sps.vui_parameters.nal_hrd_parameters_present_flag);
        assert!(sps.vui_parameters.pic_struct_present_flag);
        assert_eq!(hrd.bit_rate_value_minus1[0], 999);
        assert_eq!(hrd.cpb_size_value_minus1[0], 2999);
        assert!(hrd.cbr_flag[0]);
    }
}
