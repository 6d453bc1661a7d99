// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Level limits of H.264 Table A-1 and the profile dependent factors of Table A-2.

use crate::codec::h264::syntax::Level;
use crate::codec::h264::syntax::Profile;

/// One row of H.264 Table A-1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelLimits {
    pub level: Level,
    /// Max macroblock processing rate (MB/s).
    pub max_mbps: u32,
    /// Max frame size (MBs).
    pub max_fs: u32,
    /// Max decoded picture buffer size (MBs).
    pub max_dpb_mbs: u32,
    /// Max video bitrate, in units of `cpb_nal_factor` bits/s.
    pub max_br: u32,
    /// Max CPB size, in units of `cpb_nal_factor` bits.
    pub max_cpb: u32,
    /// Min compression ratio.
    pub min_cr: u32,
}

impl LevelLimits {
    const fn new(
        level: Level,
        max_mbps: u32,
        max_fs: u32,
        max_dpb_mbs: u32,
        max_br: u32,
        max_cpb: u32,
        min_cr: u32,
    ) -> Self {
        Self {
            level,
            max_mbps,
            max_fs,
            max_dpb_mbs,
            max_br,
            max_cpb,
            min_cr,
        }
    }

    /// `level_idc` of the level, 9 for level 1b.
    pub fn level_idc(&self) -> u8 {
        self.level as u8
    }
}

/// Largest MaxFS of Table A-1, in macroblocks.
pub const MAX_FRAME_SIZE_MBS: u32 = 139264;

/// H.264 Table A-1, in ascending order.
pub const LEVEL_LIMITS: [LevelLimits; 20] = [
    LevelLimits::new(Level::L1, 1485, 99, 396, 64, 175, 2),
    LevelLimits::new(Level::L1B, 1485, 99, 396, 128, 350, 2),
    LevelLimits::new(Level::L1_1, 3000, 396, 900, 192, 500, 2),
    LevelLimits::new(Level::L1_2, 6000, 396, 2376, 384, 1000, 2),
    LevelLimits::new(Level::L1_3, 11880, 396, 2376, 768, 2000, 2),
    LevelLimits::new(Level::L2_0, 11880, 396, 2376, 2000, 2000, 2),
    LevelLimits::new(Level::L2_1, 19800, 792, 4752, 4000, 4000, 2),
    LevelLimits::new(Level::L2_2, 20250, 1620, 8100, 4000, 4000, 2),
    LevelLimits::new(Level::L3, 40500, 1620, 8100, 10000, 10000, 2),
    LevelLimits::new(Level::L3_1, 108000, 3600, 18000, 14000, 14000, 4),
    LevelLimits::new(Level::L3_2, 216000, 5120, 20480, 20000, 20000, 4),
    LevelLimits::new(Level::L4, 245760, 8192, 32768, 20000, 25000, 4),
    LevelLimits::new(Level::L4_1, 245760, 8192, 32768, 50000, 62500, 2),
    LevelLimits::new(Level::L4_2, 522240, 8704, 34816, 50000, 62500, 2),
    LevelLimits::new(Level::L5, 589824, 22080, 110400, 135000, 135000, 2),
    LevelLimits::new(Level::L5_1, 983040, 36864, 184320, 240000, 240000, 2),
    LevelLimits::new(Level::L5_2, 2073600, 36864, 184320, 240000, 240000, 2),
    LevelLimits::new(Level::L6, 4177920, 139264, 696320, 240000, 240000, 2),
    LevelLimits::new(Level::L6_1, 8355840, 139264, 696320, 480000, 480000, 2),
    LevelLimits::new(Level::L6_2, 16711680, 139264, 696320, 800000, 800000, 2),
];

/// Returns the Table A-1 row of `level`.
pub fn level_limits(level: Level) -> &'static LevelLimits {
    // Every level has a row, the fallback is never reached.
    LEVEL_LIMITS
        .iter()
        .find(|limits| limits.level == level)
        .unwrap_or(&LEVEL_LIMITS[0])
}

/// `cpbBrNalFactor` of Table A-2.
pub fn cpb_nal_factor(profile: Profile) -> u32 {
    match profile {
        Profile::High | Profile::MultiviewHigh | Profile::StereoHigh => 1500,
        Profile::High10 => 3600,
        Profile::High422P | Profile::High444 => 4800,
        _ => 1200,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_ordered() {
        for pair in LEVEL_LIMITS.windows(2) {
            assert!(pair[0].max_mbps <= pair[1].max_mbps);
            assert!(pair[0].max_fs <= pair[1].max_fs);
            assert!(pair[0].max_br <= pair[1].max_br);
        }

        let largest = LEVEL_LIMITS.iter().map(|limits| limits.max_fs).max();
        assert_eq!(largest, Some(MAX_FRAME_SIZE_MBS));
    }

    #[test]
    fn lookups() {
        assert_eq!(level_limits(Level::L4).max_fs, 8192);
        assert_eq!(level_limits(Level::L1B).level_idc(), 9);
        assert_eq!(level_limits(Level::L3_1).min_cr, 4);

        assert_eq!(cpb_nal_factor(Profile::ConstrainedBaseline), 1200);
        assert_eq!(cpb_nal_factor(Profile::High), 1500);
        assert_eq!(cpb_nal_factor(Profile::High444), 4800);
    }
}
