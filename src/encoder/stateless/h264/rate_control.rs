// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitrate estimation, HRD rounding and per-slice QP.

use crate::codec::h264::syntax::SliceType;
use crate::codec::h264::syntax::HRD_BITRATE_SCALE;
use crate::codec::h264::syntax::HRD_CPB_SIZE_SCALE;
use crate::encoder::RateControl;
use crate::Fraction;

/// Bits spent per macroblock with both CABAC and the 8x8 transform enabled.
const DEFAULT_BITS_PER_MB: u64 = 48;

/// Estimates a bitrate, in kbit/s, good enough for the coding tools in use.
pub fn estimate_bitrate(
    mb_count: u32,
    framerate: Fraction,
    use_cabac: bool,
    use_dct8x8: bool,
) -> u32 {
    let mut bits_per_mb = DEFAULT_BITS_PER_MB;
    if !use_cabac {
        bits_per_mb += bits_per_mb * 15 / 100;
    }
    if !use_dct8x8 {
        bits_per_mb += bits_per_mb * 10 / 100;
    }

    let bits_per_frame = mb_count as u64 * bits_per_mb;
    let kbps = bits_per_frame * framerate.num as u64 / framerate.den as u64 / 1000;

    u32::try_from(kbps).unwrap_or(u32::MAX)
}

/// Target bitrate in kbit/s, zero in constant QP mode.
pub fn target_bitrate(
    rate_control: &RateControl,
    mb_count: u32,
    framerate: Fraction,
    use_cabac: bool,
    use_dct8x8: bool,
) -> u32 {
    if rate_control.is_constant_quality() {
        return 0;
    }

    match rate_control.bitrate_target() {
        Some(kbps) => kbps,
        None => {
            let kbps = estimate_bitrate(mb_count, framerate, use_cabac, use_dct8x8);
            log::debug!("target bitrate computed to {} kbps", kbps);
            kbps
        }
    }
}

/// Bitrate and CPB size as signalled in the HRD parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HrdBudget {
    /// Bitrate in bits/s, a multiple of `1 << HRD_BITRATE_SCALE`.
    pub bitrate_bits: u32,
    /// CPB size in bits, a multiple of `1 << HRD_CPB_SIZE_SCALE`.
    pub cpb_bits: u32,
}

impl HrdBudget {
    /// Rounds the bitrate down and the CPB size up to the HRD granularity. `cpb_length` is in
    /// milliseconds.
    pub fn new(bitrate_kbps: u32, cpb_length: u32) -> Self {
        if bitrate_kbps == 0 {
            return Default::default();
        }

        let bitrate_mask = (1u64 << HRD_BITRATE_SCALE) - 1;
        let cpb_mask = (1u64 << HRD_CPB_SIZE_SCALE) - 1;

        let bitrate = (bitrate_kbps as u64 * 1000) & !bitrate_mask;
        let cpb = (bitrate * cpb_length as u64 / 1000 + cpb_mask) & !cpb_mask;

        Self {
            bitrate_bits: u32::try_from(bitrate).unwrap_or(u32::MAX & !(bitrate_mask as u32)),
            cpb_bits: u32::try_from(cpb).unwrap_or(u32::MAX & !(cpb_mask as u32)),
        }
    }

    /// Initial CPB fullness, half of the buffer.
    pub fn initial_buffer_fullness(&self) -> u32 {
        self.cpb_bits / 2
    }
}

/// QP range and offsets of the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QpParams {
    pub init_qp: u8,
    pub min_qp: u8,
    pub max_qp: u8,
    /// QP of I pictures.
    pub qp_i: u8,
    pub qp_ip: i8,
    pub qp_ib: i8,
    /// Per picture type offsets only apply in constant QP mode.
    pub constant_quality: bool,
}

impl QpParams {
    /// Builds the QP parameters, widening the `[min_qp, max_qp]` range to contain `init_qp`.
    pub fn new(
        init_qp: u8,
        min_qp: u8,
        max_qp: u8,
        qp_ip: i8,
        qp_ib: i8,
        constant_quality: bool,
    ) -> Self {
        Self {
            init_qp,
            min_qp: min_qp.min(init_qp),
            max_qp: max_qp.max(init_qp),
            qp_i: init_qp,
            qp_ip,
            qp_ib,
            constant_quality,
        }
    }

    /// `slice_qp_delta` of a slice of type `slice_type`.
    pub fn slice_qp_delta(&self, slice_type: SliceType) -> i8 {
        let init_qp = self.init_qp as i32;
        let mut delta = self.qp_i as i32 - init_qp;

        if self.constant_quality {
            delta += match slice_type {
                SliceType::P => self.qp_ip as i32,
                SliceType::B => self.qp_ib as i32,
                _ => 0,
            };

            delta = delta.clamp(self.min_qp as i32 - init_qp, self.max_qp as i32 - init_qp);
        }

        delta as i8
    }
}

/// Rate control parameters handed to the backend along with every picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateControlParams {
    /// Zero in constant QP mode.
    pub bits_per_second: u32,
    /// Window of the rate control, the CPB length in milliseconds.
    pub window_size: u32,
    pub initial_qp: u8,
    pub min_qp: u8,
    pub max_qp: u8,
    pub hrd_buffer_size: u32,
    pub hrd_initial_buffer_fullness: u32,
}

impl RateControlParams {
    pub fn new(hrd: &HrdBudget, cpb_length: u32, qp: &QpParams) -> Self {
        Self {
            bits_per_second: hrd.bitrate_bits,
            window_size: cpb_length,
            initial_qp: qp.init_qp,
            min_qp: qp.min_qp,
            max_qp: qp.max_qp,
            hrd_buffer_size: hrd.cpb_bits,
            hrd_initial_buffer_fullness: hrd.initial_buffer_fullness(),
        }
    }
}
