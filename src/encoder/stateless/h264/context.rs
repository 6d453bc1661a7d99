// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Worst case sizing of the backend allocations.

use crate::codec::h264::syntax::Profile;
use crate::codec::h264::syntax::MB_SIZE;
use crate::encoder::h264::ComplianceMode;
use crate::encoder::h264::EntryPoint;
use crate::encoder::stateless::h264::gop::GopParams;
use crate::Resolution;

/// Reconstructed surfaces in flight on top of the reference frames.
const DEFAULT_SURFACES_COUNT: u32 = 3;

/// Raw 4:2:0 macroblock size upper bound, in bytes.
const MAX_MB_BYTES: usize = 400;

// Header size upper bounds, in bits.
const MAX_SPS_HDR_SIZE: usize = 16473;
const MAX_VUI_PARAMS_SIZE: usize = 210;
const MAX_HRD_PARAMS_SIZE: usize = 4103;
const MAX_PPS_HDR_SIZE: usize = 101;
const MAX_SLICE_HDR_SIZE: usize = 397 + 2572 + 6670 + 2402;

/// Bytes taken by a NAL unit of `bits` bits behind a 4 byte start code.
const fn nal_bytes(bits: usize) -> usize {
    4 + bits.next_multiple_of(8) / 8
}

/// Size in bytes of a buffer able to hold any coded picture.
pub fn coded_buffer_size(
    resolution: Resolution,
    num_slices: u32,
    compliance_mode: ComplianceMode,
    min_cr: u32,
) -> usize {
    let mbs = resolution.in_blocks(MB_SIZE);
    let mut size = mbs.width as usize * mbs.height as usize * MAX_MB_BYTES;

    size += nal_bytes(MAX_SPS_HDR_SIZE + MAX_VUI_PARAMS_SIZE + 2 * MAX_HRD_PARAMS_SIZE);
    size += nal_bytes(MAX_PPS_HDR_SIZE);
    size += num_slices as usize * nal_bytes(MAX_SLICE_HDR_SIZE);

    if compliance_mode == ComplianceMode::RestrictCodedBufferAlloc {
        size /= min_cr.max(1) as usize;
    }

    size
}

/// Number of reconstructed surfaces the backend has to provide.
pub fn num_reconstructed_surfaces(num_ref_frames: u32, num_bframes: u32, num_views: u32) -> u32 {
    (num_ref_frames + (num_bframes > 0) as u32 + DEFAULT_SURFACES_COUNT) * num_views
}

/// Allocation requirements handed to the backend when the session is configured.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextInfo {
    pub profile: Profile,
    pub entry_point: EntryPoint,
    pub resolution: Resolution,
    pub num_surfaces: u32,
    pub coded_buffer_size: usize,
}

impl ContextInfo {
    pub fn new(
        profile: Profile,
        entry_point: EntryPoint,
        resolution: Resolution,
        gop: &GopParams,
        compliance_mode: ComplianceMode,
        min_cr: u32,
    ) -> Self {
        Self {
            profile,
            entry_point,
            resolution,
            num_surfaces: num_reconstructed_surfaces(
                gop.num_ref_frames,
                gop.num_bframes,
                gop.num_views,
            ),
            coded_buffer_size: coded_buffer_size(
                resolution,
                gop.num_slices,
                compliance_mode,
                min_cr,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_size() {
        let qvga = Resolution {
            width: 320,
            height: 240,
        };
        // 300 macroblocks, then SPS, PPS and one slice header.
        assert_eq!(
            coded_buffer_size(qvga, 1, ComplianceMode::Strict, 2),
            120_000 + 3116 + 17 + 1510
        );
        assert_eq!(
            coded_buffer_size(qvga, 1, ComplianceMode::RestrictCodedBufferAlloc, 2),
            124_643 / 2
        );

        let full_hd = Resolution {
            width: 1920,
            height: 1080,
        };
        assert_eq!(
            coded_buffer_size(full_hd, 4, ComplianceMode::Strict, 4),
            3_264_000 + 3116 + 17 + 4 * 1510
        );
    }

    #[test]
    fn surfaces() {
        assert_eq!(num_reconstructed_surfaces(1, 0, 1), 4);
        assert_eq!(num_reconstructed_surfaces(2, 2, 2), 12);
    }
}
