// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.
use std::io::Write;

use thiserror::Error;

use crate::codec::h264::nalu_writer::NaluWriter;
use crate::codec::h264::nalu_writer::NaluWriterError;
use crate::codec::h264::syntax::nal_ref_idc;
use crate::codec::h264::syntax::AccessUnitDelimiter;
use crate::codec::h264::syntax::HrdParams;
use crate::codec::h264::syntax::NaluHeaderMvcExtension;
use crate::codec::h264::syntax::NaluType;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::PrefixNalu;
use crate::codec::h264::syntax::RefPicListModification;
use crate::codec::h264::syntax::Sei;
use crate::codec::h264::syntax::SeiMessage;
use crate::codec::h264::syntax::Slice;
use crate::codec::h264::syntax::Sps;
use crate::codec::h264::syntax::SubsetSps;
use crate::codec::h264::syntax::EXTENDED_SAR;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for SubsetSps {}

impl private::NaluStruct for Pps {}

impl private::NaluStruct for Slice {}

impl private::NaluStruct for Sei {}

impl private::NaluStruct for AccessUnitDelimiter {}

impl private::NaluStruct for PrefixNalu {}

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings")]
    Unsupported,
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// A helper to output typed NALUs to [`std::io::Write`] using [`NaluWriter`].
///
/// Every `synthesize` function returns the length in bits of what it wrote, start code
/// included. Headers ending without `rbsp_trailing_bits()` are padded with zero bits that are not
/// accounted for.
pub struct Synthesizer<'n, N: private::NaluStruct, W: Write> {
    writer: NaluWriter<W>,
    nalu: &'n N,
}

/// Profiles whose SPS carries the chroma format, bit depth and scaling matrix fields.
const HIGH_PROFILE_IDCS: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

impl<N: private::NaluStruct, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_u(bits, value)?;
        Ok(())
    }

    fn f<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_f(bits, value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value)?;
        Ok(())
    }

    fn se<T: Into<i32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_se(value)?;
        Ok(())
    }

    fn rbsp_trailing_bits(&mut self) -> SynthesizerResult<()> {
        self.f(1, 1u32)?;

        while !self.writer.aligned() {
            self.f(1, 0u32)?;
        }

        Ok(())
    }

    fn nal_unit_header_mvc_extension(
        &mut self,
        ext: &NaluHeaderMvcExtension,
    ) -> SynthesizerResult<()> {
        // H.264 G.7.3.1.1
        self.u(1, /* svc_extension_flag */ false)?;
        self.u(1, ext.non_idr_flag)?;
        self.u(6, ext.priority_id)?;
        self.u(10, ext.view_id)?;
        self.u(3, ext.temporal_id)?;
        self.u(1, ext.anchor_pic_flag)?;
        self.u(1, ext.inter_view_flag)?;
        self.u(1, /* reserved_one_bit */ true)?;

        Ok(())
    }

    fn finish(mut self, trailing_bits: bool) -> SynthesizerResult<usize> {
        if trailing_bits {
            self.rbsp_trailing_bits()?;
        }

        let bit_len = self.writer.bit_len();
        self.writer.flush()?;
        Ok(bit_len)
    }
}

/// `seq_parameter_set_data()` shared by the SPS and the subset SPS.
fn seq_parameter_set_data<N: private::NaluStruct, W: Write>(
    s: &mut Synthesizer<'_, N, W>,
    sps: &Sps,
) -> SynthesizerResult<()> {
    // H.264 7.3.2.1.1
    s.u(8, sps.profile_idc)?;
    s.u(1, sps.constraint_set0_flag)?;
    s.u(1, sps.constraint_set1_flag)?;
    s.u(1, sps.constraint_set2_flag)?;
    s.u(1, sps.constraint_set3_flag)?;
    s.u(1, sps.constraint_set4_flag)?;
    s.u(1, sps.constraint_set5_flag)?;
    s.u(2, /* reserved_zero_2bits */ 0u32)?;
    s.u(8, sps.level_idc as u32)?;
    s.ue(sps.seq_parameter_set_id)?;

    if HIGH_PROFILE_IDCS.contains(&sps.profile_idc) {
        s.ue(sps.chroma_format_idc)?;

        if sps.chroma_format_idc == 3 {
            s.u(1, sps.separate_colour_plane_flag)?;
        }

        s.ue(sps.bit_depth_luma_minus8)?;
        s.ue(sps.bit_depth_chroma_minus8)?;
        s.u(1, sps.qpprime_y_zero_transform_bypass_flag)?;

        if sps.seq_scaling_matrix_present_flag {
            return Err(SynthesizerError::Unsupported);
        }
        s.u(1, sps.seq_scaling_matrix_present_flag)?;
    }

    s.ue(sps.log2_max_frame_num_minus4)?;

    if sps.pic_order_cnt_type != 0 {
        return Err(SynthesizerError::Unsupported);
    }
    s.ue(sps.pic_order_cnt_type)?;
    s.ue(sps.log2_max_pic_order_cnt_lsb_minus4)?;

    s.ue(sps.max_num_ref_frames)?;
    s.u(1, sps.gaps_in_frame_num_value_allowed_flag)?;
    s.ue(sps.pic_width_in_mbs_minus1)?;
    s.ue(sps.pic_height_in_map_units_minus1)?;

    if !sps.frame_mbs_only_flag {
        return Err(SynthesizerError::Unsupported);
    }
    s.u(1, sps.frame_mbs_only_flag)?;
    s.u(1, sps.direct_8x8_inference_flag)?;

    s.u(1, sps.frame_cropping_flag)?;
    if sps.frame_cropping_flag {
        s.ue(sps.frame_crop_left_offset)?;
        s.ue(sps.frame_crop_right_offset)?;
        s.ue(sps.frame_crop_top_offset)?;
        s.ue(sps.frame_crop_bottom_offset)?;
    }

    s.u(1, sps.vui_parameters_present_flag)?;
    if sps.vui_parameters_present_flag {
        vui_parameters(s, sps)?;
    }

    Ok(())
}

fn hrd_parameters<N: private::NaluStruct, W: Write>(
    s: &mut Synthesizer<'_, N, W>,
    hrd_params: &HrdParams,
) -> SynthesizerResult<()> {
    // H.264 E.1.2
    s.ue(hrd_params.cpb_cnt_minus1)?;
    s.u(4, hrd_params.bit_rate_scale)?;
    s.u(4, hrd_params.cpb_size_scale)?;

    for i in 0..=(hrd_params.cpb_cnt_minus1 as usize).min(31) {
        s.ue(hrd_params.bit_rate_value_minus1[i])?;
        s.ue(hrd_params.cpb_size_value_minus1[i])?;
        s.u(1, hrd_params.cbr_flag[i])?;
    }

    s.u(5, hrd_params.initial_cpb_removal_delay_length_minus1)?;
    s.u(5, hrd_params.cpb_removal_delay_length_minus1)?;
    s.u(5, hrd_params.dpb_output_delay_length_minus1)?;
    s.u(5, hrd_params.time_offset_length)?;

    Ok(())
}

fn vui_parameters<N: private::NaluStruct, W: Write>(
    s: &mut Synthesizer<'_, N, W>,
    sps: &Sps,
) -> SynthesizerResult<()> {
    // H.264 E.1.1
    let vui_params = &sps.vui_parameters;

    s.u(1, vui_params.aspect_ratio_info_present_flag)?;
    if vui_params.aspect_ratio_info_present_flag {
        s.u(8, vui_params.aspect_ratio_idc)?;
        if vui_params.aspect_ratio_idc == EXTENDED_SAR {
            s.u(16, vui_params.sar_width)?;
            s.u(16, vui_params.sar_height)?;
        }
    }

    s.u(1, vui_params.overscan_info_present_flag)?;
    if vui_params.overscan_info_present_flag {
        s.u(1, vui_params.overscan_appropriate_flag)?;
    }

    s.u(1, vui_params.video_signal_type_present_flag)?;
    if vui_params.video_signal_type_present_flag {
        s.u(3, vui_params.video_format)?;
        s.u(1, vui_params.video_full_range_flag)?;

        s.u(1, vui_params.colour_description_present_flag)?;
        if vui_params.colour_description_present_flag {
            s.u(8, vui_params.colour_primaries)?;
            s.u(8, vui_params.transfer_characteristics)?;
            s.u(8, vui_params.matrix_coefficients)?;
        }
    }

    s.u(1, vui_params.chroma_loc_info_present_flag)?;
    if vui_params.chroma_loc_info_present_flag {
        s.ue(vui_params.chroma_sample_loc_type_top_field)?;
        s.ue(vui_params.chroma_sample_loc_type_bottom_field)?;
    }

    s.u(1, vui_params.timing_info_present_flag)?;
    if vui_params.timing_info_present_flag {
        s.u(32, vui_params.num_units_in_tick)?;
        s.u(32, vui_params.time_scale)?;
        s.u(1, vui_params.fixed_frame_rate_flag)?;
    }

    s.u(1, vui_params.nal_hrd_parameters_present_flag)?;
    if vui_params.nal_hrd_parameters_present_flag {
        hrd_parameters(s, &vui_params.nal_hrd_parameters)?;
    }
    s.u(1, vui_params.vcl_hrd_parameters_present_flag)?;
    if vui_params.vcl_hrd_parameters_present_flag {
        hrd_parameters(s, &vui_params.vcl_hrd_parameters)?;
    }

    if vui_params.nal_hrd_parameters_present_flag || vui_params.vcl_hrd_parameters_present_flag {
        s.u(1, vui_params.low_delay_hrd_flag)?;
    }

    s.u(1, vui_params.pic_struct_present_flag)?;

    s.u(1, vui_params.bitstream_restriction_flag)?;
    if vui_params.bitstream_restriction_flag {
        s.u(1, vui_params.motion_vectors_over_pic_boundaries_flag)?;
        s.ue(vui_params.max_bytes_per_pic_denom)?;
        s.ue(vui_params.max_bits_per_mb_denom)?;
        s.ue(vui_params.log2_max_mv_length_horizontal)?;
        s.ue(vui_params.log2_max_mv_length_vertical)?;
        s.ue(vui_params.max_num_reorder_frames)?;
        s.ue(vui_params.max_dec_frame_buffering)?;
    }

    Ok(())
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(
        ref_idc: u8,
        sps: &'n Sps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<usize> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: sps,
        };

        s.writer.write_header(ref_idc, NaluType::Sps as u8)?;
        seq_parameter_set_data(&mut s, sps)?;
        s.finish(true)
    }
}

impl<'n, W: Write> Synthesizer<'n, SubsetSps, W> {
    pub fn synthesize(
        subset_sps: &'n SubsetSps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<usize> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: subset_sps,
        };

        s.writer
            .write_header(nal_ref_idc::HIGH, NaluType::SubsetSps as u8)?;
        seq_parameter_set_data(&mut s, &subset_sps.sps)?;
        s.seq_parameter_set_mvc_extension()?;
        s.u(1, /* additional_extension2_flag */ false)?;
        s.finish(true)
    }

    fn seq_parameter_set_mvc_extension(&mut self) -> SynthesizerResult<()> {
        // H.264 7.3.2.1.3
        let sps = &self.nalu.sps;
        if !matches!(sps.profile_idc, 118 | 128) {
            return Ok(());
        }

        let view_ids = &self.nalu.view_ids;
        if view_ids.is_empty() || view_ids.len() > 1024 {
            return Err(SynthesizerError::Unsupported);
        }
        let num_views_minus1 = view_ids.len() as u32 - 1;

        self.u(1, /* bit_equal_to_one */ true)?;

        // H.264 G.7.3.2.1.4
        self.ue(num_views_minus1)?;
        for view_id in view_ids {
            self.ue(*view_id)?;
        }

        // No inter-view prediction: every view has empty anchor and non-anchor reference lists.
        for _ in 1..=num_views_minus1 {
            self.ue(/* num_anchor_refs_l0 */ 0u32)?;
            self.ue(/* num_anchor_refs_l1 */ 0u32)?;
        }
        for _ in 1..=num_views_minus1 {
            self.ue(/* num_non_anchor_refs_l0 */ 0u32)?;
            self.ue(/* num_non_anchor_refs_l1 */ 0u32)?;
        }

        self.ue(/* num_level_values_signalled_minus1 */ 0u32)?;
        self.u(8, sps.level_idc as u32)?;
        self.ue(/* num_applicable_ops_minus1 */ 0u32)?;

        self.u(3, /* applicable_op_temporal_id */ 0u32)?;
        let num_target_views_minus1 = 1u32;
        self.ue(num_target_views_minus1)?;
        for k in 0..=num_target_views_minus1 {
            self.ue(/* applicable_op_target_view_id */ k)?;
        }
        self.ue(/* applicable_op_num_views_minus1 */ num_views_minus1)?;

        self.u(1, /* mvc_vui_parameters_present_flag */ false)?;

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    pub fn synthesize(
        ref_idc: u8,
        pps: &'n Pps,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<usize> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: pps,
        };

        s.writer.write_header(ref_idc, NaluType::Pps as u8)?;
        s.pic_parameter_set_rbsp()?;
        s.finish(true)
    }

    fn pic_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        // H.264 7.3.2.2
        self.ue(self.nalu.pic_parameter_set_id)?;
        self.ue(self.nalu.seq_parameter_set_id)?;
        self.u(1, self.nalu.entropy_coding_mode_flag)?;
        self.u(1, self.nalu.bottom_field_pic_order_in_frame_present_flag)?;

        self.ue(self.nalu.num_slice_groups_minus1)?;
        if self.nalu.num_slice_groups_minus1 > 0 {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(self.nalu.num_ref_idx_l0_default_active_minus1)?;
        self.ue(self.nalu.num_ref_idx_l1_default_active_minus1)?;
        self.u(1, self.nalu.weighted_pred_flag)?;
        self.u(2, self.nalu.weighted_bipred_idc)?;
        self.se(self.nalu.pic_init_qp_minus26)?;
        self.se(self.nalu.pic_init_qs_minus26)?;
        self.se(self.nalu.chroma_qp_index_offset)?;
        self.u(1, self.nalu.deblocking_filter_control_present_flag)?;
        self.u(1, self.nalu.constrained_intra_pred_flag)?;
        self.u(1, self.nalu.redundant_pic_cnt_present_flag)?;

        if !HIGH_PROFILE_IDCS.contains(&self.nalu.sps.profile_idc) {
            return Ok(());
        }

        if self.nalu.pic_scaling_matrix_present_flag {
            return Err(SynthesizerError::Unsupported);
        }

        self.u(1, self.nalu.transform_8x8_mode_flag)?;
        self.u(1, self.nalu.pic_scaling_matrix_present_flag)?;
        self.se(self.nalu.second_chroma_qp_index_offset)?;

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Slice, W> {
    /// Writes the NAL header, its MVC extension if any, and the slice header. The slice data
    /// is left to the backend, hence no trailing bits.
    pub fn synthesize(slice: &'n Slice, writer: W, ep_enabled: bool) -> SynthesizerResult<usize> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: slice,
        };

        s.writer
            .write_header(slice.nal_ref_idc, slice.nalu_type as u8)?;
        if let Some(ext) = &slice.mvc_extension {
            s.nal_unit_header_mvc_extension(ext)?;
        }

        s.slice_header()?;
        s.finish(false)
    }

    fn ref_pic_list_modification(
        &mut self,
        flag: bool,
        modifications: &[RefPicListModification],
    ) -> SynthesizerResult<()> {
        self.u(1, flag)?;
        if !flag {
            return Ok(());
        }

        for modification in modifications {
            self.ue(modification.modification_of_pic_nums_idc)?;
            self.ue(modification.abs_diff_pic_num_minus1)?;
        }
        self.ue(/* modification_of_pic_nums_idc: end of list */ 3u32)?;

        Ok(())
    }

    fn slice_header(&mut self) -> SynthesizerResult<()> {
        // H.264 7.3.3
        let hdr = &self.nalu.header;
        let pps = &self.nalu.pps;
        let sps = &pps.sps;

        if sps.pic_order_cnt_type != 0 || !sps.frame_mbs_only_flag {
            return Err(SynthesizerError::Unsupported);
        }

        self.ue(hdr.first_mb_in_slice)?;
        self.ue(hdr.slice_type as u32)?;
        self.ue(hdr.pic_parameter_set_id)?;
        self.u(
            sps.log2_max_frame_num_minus4 as usize + 4,
            hdr.frame_num as u32,
        )?;

        if self.nalu.is_idr() {
            self.ue(hdr.idr_pic_id)?;
        }

        self.u(
            sps.log2_max_pic_order_cnt_lsb_minus4 as usize + 4,
            hdr.pic_order_cnt_lsb as u32,
        )?;

        if hdr.slice_type.is_b() {
            self.u(1, hdr.direct_spatial_mv_pred_flag)?;
        }

        if hdr.slice_type.is_p() || hdr.slice_type.is_b() {
            self.u(1, hdr.num_ref_idx_active_override_flag)?;
            if hdr.num_ref_idx_active_override_flag {
                self.ue(hdr.num_ref_idx_l0_active_minus1)?;
                if hdr.slice_type.is_b() {
                    self.ue(hdr.num_ref_idx_l1_active_minus1)?;
                }
            }
        }

        if !hdr.slice_type.is_i() {
            self.ref_pic_list_modification(
                hdr.ref_pic_list_modification_flag_l0,
                &hdr.ref_pic_list_modification_l0,
            )?;
        }

        if hdr.slice_type.is_b() {
            self.ref_pic_list_modification(
                hdr.ref_pic_list_modification_flag_l1,
                &hdr.ref_pic_list_modification_l1,
            )?;
        }

        if self.nalu.nal_ref_idc != 0 {
            // H.264 7.3.3.3
            let marking = &hdr.dec_ref_pic_marking;
            if self.nalu.is_idr() {
                self.u(1, marking.no_output_of_prior_pics_flag)?;
                self.u(1, marking.long_term_reference_flag)?;
            } else {
                if marking.adaptive_ref_pic_marking_mode_flag {
                    return Err(SynthesizerError::Unsupported);
                }
                self.u(1, marking.adaptive_ref_pic_marking_mode_flag)?;
            }
        }

        if pps.entropy_coding_mode_flag && !hdr.slice_type.is_i() {
            self.ue(hdr.cabac_init_idc)?;
        }

        self.se(hdr.slice_qp_delta)?;

        if pps.deblocking_filter_control_present_flag {
            self.ue(hdr.disable_deblocking_filter_idc)?;
            if hdr.disable_deblocking_filter_idc != 1 {
                self.se(hdr.slice_alpha_c0_offset_div2)?;
                self.se(hdr.slice_beta_offset_div2)?;
            }
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, PrefixNalu, W> {
    /// Writes a prefix NAL unit header. The payload is empty for base views.
    pub fn synthesize(
        prefix: &'n PrefixNalu,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<usize> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: prefix,
        };

        s.writer
            .write_header(prefix.nal_ref_idc, NaluType::PrefixUnit as u8)?;
        s.nal_unit_header_mvc_extension(&prefix.mvc_extension)?;
        s.finish(false)
    }
}

impl<'n, W: Write> Synthesizer<'n, AccessUnitDelimiter, W> {
    pub fn synthesize(
        aud: &'n AccessUnitDelimiter,
        writer: W,
        ep_enabled: bool,
    ) -> SynthesizerResult<usize> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: aud,
        };

        s.writer
            .write_header(nal_ref_idc::NONE, NaluType::AuDelimiter as u8)?;
        s.u(3, aud.primary_pic_type)?;
        s.finish(true)
    }
}

impl<'n, W: Write> Synthesizer<'n, Sei, W> {
    pub fn synthesize(sei: &'n Sei, writer: W, ep_enabled: bool) -> SynthesizerResult<usize> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: sei,
        };

        s.writer
            .write_header(nal_ref_idc::NONE, NaluType::Sei as u8)?;

        for message in &sei.messages {
            let payload = Self::sei_payload(message)?;
            if payload.len() > 0xff {
                return Err(SynthesizerError::Unsupported);
            }

            s.u(8, message.payload_type())?;
            s.u(8, payload.len() as u32)?;
            for byte in payload {
                s.u(8, byte)?;
            }
        }

        s.finish(true)
    }

    /// Serializes a SEI payload (H.264 7.3.2.3.1) into its own byte aligned buffer.
    fn sei_payload(message: &SeiMessage) -> SynthesizerResult<Vec<u8>> {
        let mut payload = Vec::new();

        {
            let mut w = NaluWriter::new(&mut payload, false);

            match message {
                SeiMessage::BufferingPeriod(bp) => {
                    // H.264 D.1.2, NAL HRD only
                    let length = bp.delay_length as usize;
                    w.write_ue(bp.seq_parameter_set_id)?;
                    w.write_u(length, bp.initial_cpb_removal_delay)?;
                    w.write_u(length, bp.initial_cpb_removal_delay_offset)?;
                }
                SeiMessage::PicTiming(pt) => {
                    // H.264 D.1.3
                    w.write_u(pt.cpb_removal_delay_length as usize, pt.cpb_removal_delay)?;
                    w.write_u(pt.dpb_output_delay_length as usize, pt.dpb_output_delay)?;

                    if pt.pic_struct_present {
                        if pt.pic_struct != 0 {
                            return Err(SynthesizerError::Unsupported);
                        }

                        w.write_u(4, pt.pic_struct)?;
                        // A frame carries a single clock timestamp (Table D-1).
                        w.write_u(1, /* clock_timestamp_flag */ false)?;
                    }
                }
            }

            if !w.aligned() {
                w.write_trailing_bits()?;
            }
        }

        Ok(payload)
    }
}
