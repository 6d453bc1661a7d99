// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decision and header-synthesis core of a hardware-accelerated H.264 encoder.
//!
//! The crate turns display-order frames into coding-order pictures, keeps the per-view reference
//! pools, negotiates profile/level/rate-control parameters and serializes every header the
//! hardware backend needs. Pixel-domain encoding is left to the backend, see
//! [`encoder::stateless::h264::StatelessH264EncoderBackend`].

pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod encoder;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Returns the resolution in macroblocks of `mb_size` pixels, rounding up.
    pub fn in_blocks(&self, mb_size: u32) -> Resolution {
        Resolution {
            width: self.width.div_ceil(mb_size),
            height: self.height.div_ceil(mb_size),
        }
    }
}

/// A rational number, used for framerates and pixel aspect ratios.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Fraction {
    pub num: u32,
    pub den: u32,
}

impl Fraction {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

/// Instructs the encoder on whether it should block on the backend operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockingMode {
    #[default]
    Blocking,
    NonBlocking,
}
