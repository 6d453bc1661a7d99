// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the encoder
//! run so we can test it in isolation.
//!
//! The coded output of a picture is the concatenation of its packed headers, each slice header
//! followed by a fake slice payload.

use std::collections::BTreeSet;

use anyhow::anyhow;

use crate::codec::h264::syntax::Profile;
use crate::encoder::h264::EntryPoint;
use crate::encoder::stateless::h264::context::ContextInfo;
use crate::encoder::stateless::h264::reorder::PictureInfo;
use crate::encoder::stateless::h264::BackendRequest;
use crate::encoder::stateless::h264::StatelessH264EncoderBackend;
use crate::encoder::stateless::ReadyPromise;
use crate::encoder::stateless::StatelessBackendError;
use crate::encoder::stateless::StatelessBackendResult;
use crate::encoder::stateless::StatelessEncoderBackendImport;
use crate::encoder::FrameMetadata;
use crate::encoder::PackedHeaderType;

/// Payload appended after every slice header, a single rbsp stop bit.
pub const FAKE_SLICE_DATA: [u8; 1] = [0x80];

/// A numbered reconstructed surface. Not `Clone`, the encoder has to give it back.
#[derive(Debug, PartialEq, Eq)]
pub struct Surface(pub u32);

/// What the backend received for one picture.
#[derive(Debug, Clone)]
pub struct SubmittedPicture {
    /// Value of the input handle.
    pub input: u64,
    pub timestamp: u64,
    pub picture: PictureInfo,
    pub new_sequence: bool,
    pub sps_id: u8,
    pub pps_id: u8,
    pub header_types: Vec<PackedHeaderType>,
    /// `(first_mb, num_mbs)` of every slice.
    pub slices: Vec<(u32, u32)>,
    /// Surfaces of the reference lists, in list order.
    pub list0: Vec<u32>,
    pub list1: Vec<u32>,
    /// Surfaces of the whole reference pool.
    pub reference_frames: Vec<u32>,
    pub recon: u32,
}

/// Capabilities reported by the dummy backend.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub profiles: Vec<(Profile, EntryPoint)>,
    pub max_reflist_counts: (u32, u32),
    pub low_power_max_reflist_counts: (u32, u32),
}

impl Default for Capabilities {
    fn default() -> Self {
        let mut profiles = Vec::new();
        for profile in [
            Profile::ConstrainedBaseline,
            Profile::Main,
            Profile::High,
            Profile::StereoHigh,
            Profile::MultiviewHigh,
        ] {
            profiles.push((profile, EntryPoint::Encode));
            profiles.push((profile, EntryPoint::EncodeLowPower));
        }

        Self {
            profiles,
            max_reflist_counts: (4, 1),
            low_power_max_reflist_counts: (4, 0),
        }
    }
}

/// Dummy H.264 encoder backend.
#[derive(Default)]
pub struct Backend {
    caps: Capabilities,
    context: Option<ContextInfo>,
    next_surface: u32,
    live_surfaces: BTreeSet<u32>,
    fail_next_picture: bool,
    pub submitted: Vec<SubmittedPicture>,
}

impl Backend {
    pub fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            ..Default::default()
        }
    }

    /// Context of the last [`StatelessH264EncoderBackend::configure`] call.
    pub fn context(&self) -> Option<&ContextInfo> {
        self.context.as_ref()
    }

    /// Reconstructed surfaces not returned by the encoder yet.
    pub fn live_surfaces(&self) -> usize {
        self.live_surfaces.len()
    }

    /// Makes the next [`StatelessH264EncoderBackend::encode_picture`] call fail.
    pub fn fail_next_picture(&mut self) {
        self.fail_next_picture = true;
    }
}

impl StatelessH264EncoderBackend for Backend {
    type Picture = u64;
    type Reconstructed = Surface;
    type CodedPromise = ReadyPromise<Vec<u8>>;

    fn encode_profiles(&self) -> Vec<Profile> {
        let mut profiles: Vec<Profile> = Vec::new();
        for (profile, _) in &self.caps.profiles {
            if !profiles.contains(profile) {
                profiles.push(*profile);
            }
        }
        profiles
    }

    fn has_encoder(&self, profile: Profile, entry_point: EntryPoint) -> bool {
        self.caps.profiles.contains(&(profile, entry_point))
    }

    fn max_reflist_counts(&self, entry_point: EntryPoint) -> (u32, u32) {
        match entry_point {
            EntryPoint::Encode => self.caps.max_reflist_counts,
            EntryPoint::EncodeLowPower => self.caps.low_power_max_reflist_counts,
        }
    }

    fn configure(&mut self, context: &ContextInfo) -> StatelessBackendResult<()> {
        if !self.has_encoder(context.profile, context.entry_point) {
            return Err(StatelessBackendError::UnsupportedProfile);
        }

        log::debug!("dummy backend configured with {:?}", context);
        self.context = Some(context.clone());
        Ok(())
    }

    fn new_reconstructed(&mut self) -> StatelessBackendResult<Surface> {
        let limit = self.context.as_ref().map_or(0, |ctx| ctx.num_surfaces as usize);
        if self.live_surfaces.len() >= limit {
            return Err(StatelessBackendError::OutOfResources);
        }

        let id = self.next_surface;
        self.next_surface += 1;
        self.live_surfaces.insert(id);

        Ok(Surface(id))
    }

    fn release_reconstructed(&mut self, recon: Surface) {
        if !self.live_surfaces.remove(&recon.0) {
            log::error!("surface {} released twice", recon.0);
        }
    }

    fn encode_picture(
        &mut self,
        request: BackendRequest<'_, u64, Surface>,
    ) -> StatelessBackendResult<ReadyPromise<Vec<u8>>> {
        if std::mem::take(&mut self.fail_next_picture) {
            return Err(StatelessBackendError::Other(anyhow!(
                "injected failure for poc {}",
                request.picture.poc
            )));
        }

        let mut coded = request.coded_output;
        for header in &request.packed_headers {
            coded.extend_from_slice(&header.data);
            if header.header_type == PackedHeaderType::Slice {
                coded.extend_from_slice(&FAKE_SLICE_DATA);
            }
        }

        self.submitted.push(SubmittedPicture {
            input: request.input,
            timestamp: request.input_meta.timestamp,
            picture: request.picture,
            new_sequence: request.new_sequence,
            sps_id: request.sps.seq_parameter_set_id,
            pps_id: request.pps.pic_parameter_set_id,
            header_types: request
                .packed_headers
                .iter()
                .map(|header| header.header_type)
                .collect(),
            slices: request
                .slices
                .iter()
                .map(|slice| (slice.macroblock_address, slice.num_macroblocks))
                .collect(),
            list0: request.ref_lists.list0.iter().map(|e| e.surface.0).collect(),
            list1: request.ref_lists.list1.iter().map(|e| e.surface.0).collect(),
            reference_frames: request.reference_frames.iter().map(|e| e.surface.0).collect(),
            recon: request.recon.0,
        });

        Ok(ReadyPromise::from(coded))
    }
}

impl StatelessEncoderBackendImport<u64, u64> for Backend {
    fn import_picture(
        &mut self,
        _metadata: &FrameMetadata,
        handle: u64,
    ) -> StatelessBackendResult<u64> {
        Ok(handle)
    }
}
