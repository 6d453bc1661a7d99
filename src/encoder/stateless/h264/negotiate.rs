// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Profile and level negotiation.
//!
//! The minimal profile is derived from the requested coding tools, then reconciled with the
//! hardware and user imposed `profile_idc` ceilings. Negotiation never mutates the requested
//! [`ToolSet`], it returns the resolved one next to the profile instead.

use thiserror::Error;

use crate::codec::h264::levels::cpb_nal_factor;
use crate::codec::h264::levels::LevelLimits;
use crate::codec::h264::levels::LEVEL_LIMITS;
use crate::codec::h264::syntax::Level;
use crate::codec::h264::syntax::Profile;
use crate::encoder::h264::EntryPoint;
use crate::encoder::h264::Tune;
use crate::encoder::stateless::h264::StatelessH264EncoderBackend;
use crate::Fraction;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("profile {required} is required but profile_idc is limited to {ceiling}")]
    UnsupportedProfile { required: Profile, ceiling: u8 },
    #[error("no level holds {pic_size_mbs} macroblocks per picture at {max_mbps} macroblocks/s")]
    NoSuitableLevel { pic_size_mbs: u64, max_mbps: u64 },
    #[error("no hardware encoder for profile {0} with the {1:?} entry point")]
    NoHardwareProfile(Profile, EntryPoint),
}

pub type NegotiationResult<T> = Result<T, NegotiationError>;

/// Coding tools that decide the profile of the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ToolSet {
    pub use_cabac: bool,
    pub use_dct8x8: bool,
    pub num_bframes: u32,
    pub num_views: u32,
}

impl ToolSet {
    /// Lowest profile able to carry the tools.
    pub fn minimal_profile(&self) -> Profile {
        match self.num_views {
            2 => return Profile::StereoHigh,
            n if n > 2 => return Profile::MultiviewHigh,
            _ => (),
        }

        if self.use_dct8x8 {
            Profile::High
        } else if self.num_bframes > 0 || self.use_cabac {
            Profile::Main
        } else {
            Profile::ConstrainedBaseline
        }
    }

    /// Enables the tools allowed by `ceiling` when `tune` asks for it.
    pub fn tuned(mut self, tune: Tune, ceiling: u8) -> Self {
        if tune != Tune::HighCompression {
            return self;
        }

        if ceiling >= Profile::Main.idc() && ceiling != Profile::Extended.idc() {
            self.use_cabac = true;
            if self.num_bframes == 0 {
                self.num_bframes = 1;
            }
        }

        if ceiling >= Profile::High.idc() {
            self.use_dct8x8 = true;
        }

        self
    }
}

/// Snapshot of the capabilities of a backend, taken once per configuration.
#[derive(Clone, Debug, Default)]
pub struct HardwareCaps {
    /// Highest `profile_idc` among the encode profiles.
    pub max_profile_idc: u8,
    /// Every supported profile and entry point pair.
    pub encoders: Vec<(Profile, EntryPoint)>,
    /// Maximum size of reference list 0 for the configured entry point.
    pub max_reflist0_count: u32,
    /// Maximum size of reference list 1 for the configured entry point.
    pub max_reflist1_count: u32,
}

impl HardwareCaps {
    pub fn query<B: StatelessH264EncoderBackend>(backend: &B, entry_point: EntryPoint) -> Self {
        let mut encoders = Vec::new();
        for profile in backend.encode_profiles() {
            for ep in [EntryPoint::Encode, EntryPoint::EncodeLowPower] {
                if backend.has_encoder(profile, ep) {
                    encoders.push((profile, ep));
                }
            }
        }

        let (max_reflist0_count, max_reflist1_count) = backend.max_reflist_counts(entry_point);

        Self {
            max_profile_idc: backend.hw_max_profile_idc(),
            encoders,
            max_reflist0_count,
            max_reflist1_count,
        }
    }

    pub fn has_encoder(&self, profile: Profile, entry_point: EntryPoint) -> bool {
        self.encoders.contains(&(profile, entry_point))
    }
}

/// Reconciles the profile required by `requested` with the hardware and user ceilings.
///
/// Coding tools are disabled, 8x8 transform first and then B-frames and CABAC, until the profile
/// fits. When even the minimal set of tools does not fit, [`NegotiationError::UnsupportedProfile`]
/// is returned. When the user ceiling is above the derived profile, the profile is raised toward
/// it without changing the tools.
pub fn negotiate(
    requested: ToolSet,
    hw_max_idc: u8,
    user_max_idc: Option<u8>,
) -> NegotiationResult<(Profile, ToolSet)> {
    let ceiling = user_max_idc.map_or(hw_max_idc, |user| user.min(hw_max_idc));

    let mut tools = requested;
    let mut profile = tools.minimal_profile();

    if profile.idc() > ceiling {
        log::warn!(
            "profile {} exceeds profile_idc {}, disabling coding tools",
            profile,
            ceiling
        );

        if ceiling < Profile::High.idc() {
            tools.use_dct8x8 = false;
        }

        if ceiling < Profile::Main.idc() {
            tools.num_bframes = 0;
            tools.use_cabac = false;
        }

        profile = tools.minimal_profile();
        if profile.idc() > ceiling {
            return Err(NegotiationError::UnsupportedProfile {
                required: profile,
                ceiling,
            });
        }
    }

    if let Some(user_max) = user_max_idc {
        let target = user_max.min(hw_max_idc);
        if profile.idc() < target {
            let mut raised = profile;
            if target > Profile::Baseline.idc() {
                raised = Profile::Main;
            }
            if target > Profile::Main.idc() {
                raised = Profile::High;
            }
            if target > Profile::High.idc() && tools.num_views > 1 {
                raised = if tools.num_views == 2 {
                    Profile::StereoHigh
                } else {
                    Profile::MultiviewHigh
                };
            }

            if raised.idc() <= target && raised.idc() > profile.idc() {
                profile = raised;
            }
        }
    }

    Ok((profile, tools))
}

/// Picks the first profile able to decode `profile` streams that the hardware can encode with
/// `entry_point`.
pub fn ensure_hw_profile(
    profile: Profile,
    entry_point: EntryPoint,
    caps: &HardwareCaps,
) -> NegotiationResult<Profile> {
    let candidates: &[Profile] = match profile {
        Profile::ConstrainedBaseline => &[
            Profile::ConstrainedBaseline,
            Profile::Baseline,
            Profile::Main,
            Profile::High,
        ],
        Profile::Main => &[Profile::Main, Profile::High],
        _ => std::slice::from_ref(&profile),
    };

    candidates
        .iter()
        .copied()
        .find(|candidate| caps.has_encoder(*candidate, entry_point))
        .ok_or(NegotiationError::NoHardwareProfile(profile, entry_point))
}

/// Returns the lowest level of Table A-1 holding the stream. `bitrate_bits` and `cpb_bits` are
/// ignored when zero.
pub fn derive_level(
    profile: Profile,
    mb_width: u32,
    mb_height: u32,
    num_bframes: u32,
    framerate: Fraction,
    bitrate_bits: u32,
    cpb_bits: u32,
) -> NegotiationResult<&'static LevelLimits> {
    let cpb_factor = cpb_nal_factor(profile) as u64;

    let pic_size_mbs = mb_width as u64 * mb_height as u64;
    let max_dpb_mbs = pic_size_mbs * if num_bframes > 0 { 2 } else { 1 };
    let max_mbps = (pic_size_mbs * framerate.num as u64).div_ceil(framerate.den as u64);

    LEVEL_LIMITS
        .iter()
        .find(|limits| {
            pic_size_mbs <= limits.max_fs as u64
                && max_dpb_mbs <= limits.max_dpb_mbs as u64
                && max_mbps <= limits.max_mbps as u64
                && (bitrate_bits == 0 || bitrate_bits as u64 <= limits.max_br as u64 * cpb_factor)
                && (cpb_bits == 0 || cpb_bits as u64 <= limits.max_cpb as u64 * cpb_factor)
        })
        .ok_or(NegotiationError::NoSuitableLevel {
            pic_size_mbs,
            max_mbps,
        })
}

/// Returns the higher of `derived` and `requested`, in Table A-1 order.
pub fn max_level(derived: &'static LevelLimits, requested: Option<Level>) -> &'static LevelLimits {
    let position = |level: Level| LEVEL_LIMITS.iter().position(|limits| limits.level == level);

    match requested.and_then(position) {
        Some(index) if Some(index) > position(derived.level) => &LEVEL_LIMITS[index],
        _ => derived,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tools(use_cabac: bool, use_dct8x8: bool, num_bframes: u32, num_views: u32) -> ToolSet {
        ToolSet {
            use_cabac,
            use_dct8x8,
            num_bframes,
            num_views,
        }
    }

    #[test]
    fn minimal_profiles() {
        assert_eq!(
            tools(false, false, 0, 1).minimal_profile(),
            Profile::ConstrainedBaseline
        );
        assert_eq!(tools(true, false, 0, 1).minimal_profile(), Profile::Main);
        assert_eq!(tools(false, false, 2, 1).minimal_profile(), Profile::Main);
        assert_eq!(tools(false, true, 0, 1).minimal_profile(), Profile::High);
        assert_eq!(
            tools(false, false, 0, 2).minimal_profile(),
            Profile::StereoHigh
        );
        assert_eq!(
            tools(false, false, 0, 3).minimal_profile(),
            Profile::MultiviewHigh
        );
    }

    #[test]
    fn high_compression_tuning() {
        let base = tools(false, false, 0, 1);

        assert_eq!(base.tuned(Tune::None, 100), base);
        assert_eq!(base.tuned(Tune::HighCompression, 100), tools(true, true, 1, 1));
        assert_eq!(base.tuned(Tune::HighCompression, 77), tools(true, false, 1, 1));
        // Extended profile has no CABAC.
        assert_eq!(base.tuned(Tune::HighCompression, 88), base);
        assert_eq!(base.tuned(Tune::HighCompression, 66), base);
        // An explicit B-frame count is kept.
        assert_eq!(
            tools(false, false, 3, 1).tuned(Tune::HighCompression, 77),
            tools(true, false, 3, 1)
        );
    }

    #[test]
    fn negotiate_within_limits() {
        let (profile, resolved) = negotiate(tools(true, true, 0, 1), 100, None).unwrap();
        assert_eq!(profile, Profile::High);
        assert_eq!(resolved, tools(true, true, 0, 1));
    }

    #[test]
    fn negotiate_disables_tools_for_hardware() {
        let (profile, resolved) = negotiate(tools(true, true, 2, 1), 77, None).unwrap();
        assert_eq!(profile, Profile::Main);
        assert_eq!(resolved, tools(true, false, 2, 1));

        let (profile, resolved) = negotiate(tools(true, true, 2, 1), 66, None).unwrap();
        assert_eq!(profile, Profile::ConstrainedBaseline);
        assert_eq!(resolved, tools(false, false, 0, 1));
    }

    #[test]
    fn negotiate_user_ceiling() {
        let (profile, resolved) = negotiate(tools(true, false, 1, 1), 100, Some(66)).unwrap();
        assert_eq!(profile, Profile::ConstrainedBaseline);
        assert_eq!(resolved, tools(false, false, 0, 1));

        // MVC cannot be downgraded.
        assert_eq!(
            negotiate(tools(false, false, 0, 2), 128, Some(100)),
            Err(NegotiationError::UnsupportedProfile {
                required: Profile::StereoHigh,
                ceiling: 100
            })
        );

        assert!(matches!(
            negotiate(tools(false, false, 0, 1), 100, Some(44)),
            Err(NegotiationError::UnsupportedProfile { .. })
        ));
    }

    #[test]
    fn negotiate_raises_toward_user_ceiling() {
        let (profile, resolved) = negotiate(tools(false, false, 0, 1), 100, Some(100)).unwrap();
        assert_eq!(profile, Profile::High);
        assert_eq!(resolved, tools(false, false, 0, 1));

        let (profile, _) = negotiate(tools(false, false, 0, 1), 100, Some(77)).unwrap();
        assert_eq!(profile, Profile::Main);

        // Never above the hardware.
        let (profile, _) = negotiate(tools(false, false, 0, 1), 77, Some(100)).unwrap();
        assert_eq!(profile, Profile::Main);
    }

    #[test]
    fn hardware_profile_fallback() {
        let caps = HardwareCaps {
            max_profile_idc: 100,
            encoders: vec![
                (Profile::Main, EntryPoint::Encode),
                (Profile::High, EntryPoint::Encode),
                (Profile::High, EntryPoint::EncodeLowPower),
            ],
            max_reflist0_count: 1,
            max_reflist1_count: 1,
        };

        assert_eq!(
            ensure_hw_profile(Profile::ConstrainedBaseline, EntryPoint::Encode, &caps),
            Ok(Profile::Main)
        );
        assert_eq!(
            ensure_hw_profile(Profile::ConstrainedBaseline, EntryPoint::EncodeLowPower, &caps),
            Ok(Profile::High)
        );
        assert_eq!(
            ensure_hw_profile(Profile::High, EntryPoint::Encode, &caps),
            Ok(Profile::High)
        );
        assert_eq!(
            ensure_hw_profile(Profile::StereoHigh, EntryPoint::Encode, &caps),
            Err(NegotiationError::NoHardwareProfile(
                Profile::StereoHigh,
                EntryPoint::Encode
            ))
        );
    }

    #[test]
    fn level_1080p30() {
        let limits =
            derive_level(Profile::High, 120, 68, 0, Fraction::new(30, 1), 0, 0).unwrap();
        assert_eq!(limits.level, Level::L4);

        // A doubled DPB still fits.
        let limits =
            derive_level(Profile::High, 120, 68, 2, Fraction::new(30, 1), 0, 0).unwrap();
        assert_eq!(limits.level, Level::L4);

        // Bitrate above the level 4 bound moves to 4.1.
        let limits = derive_level(
            Profile::High,
            120,
            68,
            0,
            Fraction::new(30, 1),
            40_000_000,
            0,
        )
        .unwrap();
        assert_eq!(limits.level, Level::L4_1);
    }

    #[test]
    fn level_small_and_fractional() {
        // QCIF at 15 fps.
        let limits =
            derive_level(Profile::ConstrainedBaseline, 11, 9, 0, Fraction::new(15, 1), 0, 0)
                .unwrap();
        assert_eq!(limits.level, Level::L1);

        // 720p at 30000/1001 fps.
        let limits = derive_level(
            Profile::Main,
            80,
            45,
            0,
            Fraction::new(30000, 1001),
            0,
            0,
        )
        .unwrap();
        assert_eq!(limits.level, Level::L3_1);
    }

    #[test]
    fn no_suitable_level() {
        assert!(matches!(
            derive_level(Profile::High, 1024, 1024, 0, Fraction::new(60, 1), 0, 0),
            Err(NegotiationError::NoSuitableLevel { .. })
        ));

        // Too many macroblocks for 32 bits.
        assert!(matches!(
            derive_level(Profile::High, 65536, 65536, 2, Fraction::new(60, 1), 0, 0),
            Err(NegotiationError::NoSuitableLevel { pic_size_mbs: 4294967296, .. })
        ));
    }

    #[test]
    fn requested_level_floor() {
        let derived = derive_level(Profile::Main, 20, 15, 0, Fraction::new(30, 1), 0, 0).unwrap();
        assert_eq!(derived.level, Level::L1_3);

        assert_eq!(max_level(derived, None).level, Level::L1_3);
        assert_eq!(max_level(derived, Some(Level::L4)).level, Level::L4);
        assert_eq!(max_level(derived, Some(Level::L1B)).level, Level::L1_3);
    }
}
