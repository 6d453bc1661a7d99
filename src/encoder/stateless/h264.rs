// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateless H.264 encoder session.
//!
//! [`StatelessEncoder`] owns the per view reorder and reference pools, decides the coding order
//! and the type of every picture, and hands the backend a [`BackendRequest`] carrying the packed
//! headers, slice parameters and reference surfaces of each picture in coding order.

use std::collections::VecDeque;
use std::rc::Rc;

use log::debug;
use log::error;
use log::trace;

use crate::codec::h264::codec_data::avc_decoder_configuration_record;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::Profile;
use crate::codec::h264::syntax::Sps;
use crate::encoder::h264::ConfigError;
use crate::encoder::h264::ConfigResult;
use crate::encoder::h264::EncoderConfig;
use crate::encoder::h264::EntryPoint;
use crate::encoder::stateless::h264::context::ContextInfo;
use crate::encoder::stateless::h264::negotiate::HardwareCaps;
use crate::encoder::stateless::h264::params::build_aud;
use crate::encoder::stateless::h264::params::build_prefix_nalu;
use crate::encoder::stateless::h264::params::build_sei;
use crate::encoder::stateless::h264::params::build_slices;
use crate::encoder::stateless::h264::params::pack_aud;
use crate::encoder::stateless::h264::params::pack_pps;
use crate::encoder::stateless::h264::params::pack_prefix_nalu;
use crate::encoder::stateless::h264::params::pack_sei;
use crate::encoder::stateless::h264::params::pack_slice;
use crate::encoder::stateless::h264::params::pack_sps;
use crate::encoder::stateless::h264::params::pack_subset_sps;
use crate::encoder::stateless::h264::params::SliceParams;
use crate::encoder::stateless::h264::params::ViewHeaders;
use crate::encoder::stateless::h264::rate_control::RateControlParams;
use crate::encoder::stateless::h264::references::RefLists;
use crate::encoder::stateless::h264::references::ReferenceEntry;
use crate::encoder::stateless::h264::references::ReferencePool;
use crate::encoder::stateless::h264::reorder::Picture;
use crate::encoder::stateless::h264::reorder::PictureInfo;
use crate::encoder::stateless::h264::reorder::ReorderPool;
use crate::encoder::stateless::h264::sequence::derive_sequence;
use crate::encoder::stateless::h264::sequence::SequenceParams;
use crate::encoder::stateless::BackendPromise;
use crate::encoder::stateless::BitstreamPromise;
use crate::encoder::stateless::EncodeError;
use crate::encoder::stateless::EncodeResult;
use crate::encoder::stateless::OutputQueue;
use crate::encoder::stateless::StatelessBackendResult;
use crate::encoder::stateless::StatelessEncoderBackendImport;
use crate::encoder::stateless::StatelessVideoEncoder;
use crate::encoder::CodedBitstreamBuffer;
use crate::encoder::FrameMetadata;
use crate::encoder::PackedHeader;
use crate::BlockingMode;

pub mod context;
pub mod gop;
pub mod negotiate;
pub mod params;
pub mod rate_control;
pub mod references;
pub mod reorder;
pub mod sequence;

/// Stateless H.264 encoder backend input, one per coded picture.
pub struct BackendRequest<'a, P, R> {
    /// Input frame to be encoded
    pub input: P,

    /// Input frame metadata
    pub input_meta: FrameMetadata,

    /// Parameter sets the slices of the picture refer to. For non-base MVC views `sps` is the
    /// subset SPS.
    pub sps: Rc<Sps>,
    pub pps: Rc<Pps>,

    /// True if the sequence headers are part of [`Self::packed_headers`].
    pub new_sequence: bool,

    /// Coding decisions of the picture.
    pub picture: PictureInfo,

    pub slices: Vec<SliceParams>,

    /// Reference lists shared by every slice of the picture.
    pub ref_lists: RefLists<'a, R>,

    /// Every picture of the view's reference pool, oldest first.
    pub reference_frames: Vec<&'a ReferenceEntry<R>>,

    /// Surface receiving the reconstructed picture.
    pub recon: &'a R,

    /// NAL units to write ahead of, and in between, the coded slices.
    pub packed_headers: Vec<PackedHeader>,

    pub rate_control: RateControlParams,

    /// Container for the request output. [`StatelessH264EncoderBackend`] impl shall move it and
    /// append the coded data to it. This prevents unnecessary copying of bitstream around.
    pub coded_output: Vec<u8>,
}

/// Trait for stateless encoder backend for H.264
pub trait StatelessH264EncoderBackend {
    /// Backend's specific representation of the input frame.
    type Picture: 'static;

    /// Backend's reconstructed frame handle.
    type Reconstructed: 'static;

    /// Backend's specific [`BackendPromise`] for the coded picture.
    type CodedPromise: BackendPromise<Output = Vec<u8>>;

    /// Profiles the hardware is able to encode.
    fn encode_profiles(&self) -> Vec<Profile>;

    fn has_encoder(&self, profile: Profile, entry_point: EntryPoint) -> bool;

    /// Largest list 0 and list 1 sizes supported by `entry_point`.
    fn max_reflist_counts(&self, entry_point: EntryPoint) -> (u32, u32);

    fn hw_max_profile_idc(&self) -> u8 {
        self.encode_profiles()
            .iter()
            .map(|profile| profile.idc())
            .max()
            .unwrap_or(0)
    }

    /// (Re)creates the encoding context. Called before the first picture of every sequence.
    fn configure(&mut self, context: &ContextInfo) -> StatelessBackendResult<()>;

    fn new_reconstructed(&mut self) -> StatelessBackendResult<Self::Reconstructed>;

    /// Returns a reconstructed surface the encoder no longer needs.
    fn release_reconstructed(&mut self, recon: Self::Reconstructed);

    /// Submits a [`BackendRequest`] to the backend. The reconstructed picture is written into
    /// [`BackendRequest::recon`].
    fn encode_picture(
        &mut self,
        request: BackendRequest<'_, Self::Picture, Self::Reconstructed>,
    ) -> StatelessBackendResult<Self::CodedPromise>;
}

/// Input frame waiting in a [`ReorderPool`].
pub struct InputFrame<P> {
    pub picture: P,
    pub meta: FrameMetadata,
}

/// Outcome of [`StatelessEncoder::submit_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The frame is held until the anchor picture of its group arrives.
    Backpressure,
    /// Pictures handed to the backend, in coding order.
    Submitted(Vec<PictureInfo>),
}

struct ViewState<P, R> {
    headers: ViewHeaders,
    reorder: ReorderPool<InputFrame<P>>,
    refs: ReferencePool<R>,
}

impl<P, R> ViewState<P, R> {
    fn new(seq: &SequenceParams, view_idx: usize) -> Self {
        Self {
            headers: ViewHeaders::new(seq, view_idx),
            reorder: ReorderPool::new(view_idx),
            refs: ReferencePool::new(&seq.gop),
        }
    }
}

/// NAL units written ahead of, and in between, the slices of a picture.
struct PictureHeaders {
    packed: Vec<PackedHeader>,
    /// The sequence headers are part of [`Self::packed`].
    new_sequence: bool,
    /// A timing SEI is part of [`Self::packed`].
    has_sei: bool,
}

/// Builds the NAL units preceding and interleaved with the slices of `pic`. Session state is
/// left untouched, it is only updated once the picture was accepted by the backend.
fn build_packed_headers<F>(
    seq: &SequenceParams,
    headers: &ViewHeaders,
    reorder: &ReorderPool<F>,
    pic: &PictureInfo,
    slices: &[SliceParams],
    config_changed: bool,
) -> EncodeResult<PictureHeaders> {
    let mut packed = Vec::with_capacity(4 + 2 * slices.len());

    if seq.use_aud {
        packed.push(pack_aud(&build_aud(pic))?);
    }

    let new_sequence = pic.is_idr || (pic.type_.is_i() && config_changed);
    if new_sequence {
        packed.push(match &headers.subset_sps {
            Some(subset_sps) => pack_subset_sps(subset_sps)?,
            None => pack_sps(&headers.sps)?,
        });
    }

    let has_sei = pic.view_idx == 0 && seq.has_hrd();
    if has_sei {
        let frame_count = reorder.peek_frame_count(pic.is_idr);
        packed.push(pack_sei(&build_sei(seq, &headers.sps, pic, frame_count))?);
    }

    if pic.type_.is_i() {
        packed.push(pack_pps(&headers.pps)?);
    }

    for slice in slices {
        if seq.is_mvc() && pic.view_idx == 0 {
            packed.push(pack_prefix_nalu(&build_prefix_nalu(pic, headers.view_id))?);
        }
        packed.push(pack_slice(&slice.slice)?);
    }

    Ok(PictureHeaders {
        packed,
        new_sequence,
        has_sei,
    })
}

pub struct StatelessEncoder<H, B>
where
    B: StatelessH264EncoderBackend,
{
    /// [`StatelessH264EncoderBackend`] instance to delegate [`BackendRequest`] to
    backend: B,

    config: EncoderConfig,
    seq: SequenceParams,
    views: Vec<ViewState<B::Picture, B::Reconstructed>>,

    /// Sequence headers have to be repeated on the next I picture.
    config_changed: bool,

    /// Set by the first submitted frame, cleared by [`Self::flush`].
    started: bool,

    /// Input frames since the last flush, selects the view of the next frame.
    frame_counter: u64,

    /// Pending coded picture promise queue
    output_queue: OutputQueue<BitstreamPromise<B::CodedPromise>>,

    /// Pending [`CodedBitstreamBuffer`]s to be polled by the user
    coded_queue: VecDeque<CodedBitstreamBuffer>,

    _phantom: std::marker::PhantomData<H>,
}

impl<H, B> StatelessEncoder<H, B>
where
    B: StatelessH264EncoderBackend,
{
    pub fn new(mut backend: B, config: EncoderConfig, mode: BlockingMode) -> EncodeResult<Self> {
        let caps = HardwareCaps::query(&backend, config.entry_point);
        let seq = derive_sequence(&config, &caps)?;
        backend.configure(&seq.context)?;

        let views = (0..seq.num_views())
            .map(|view_idx| ViewState::new(&seq, view_idx))
            .collect();

        Ok(Self {
            backend,
            config,
            seq,
            views,
            config_changed: true,
            started: false,
            frame_counter: 0,
            output_queue: OutputQueue::new(mode),
            coded_queue: Default::default(),
            _phantom: Default::default(),
        })
    }

    /// Replaces the configuration. Rejected once frames have been submitted, until the next
    /// [`Self::flush`]. The previous configuration stays active on failure.
    pub fn set_config(&mut self, config: EncoderConfig) -> ConfigResult<()> {
        if self.started {
            return Err(ConfigError::AlreadyStarted);
        }

        let caps = HardwareCaps::query(&self.backend, config.entry_point);
        let seq = derive_sequence(&config, &caps)?;

        for view in self.views.iter_mut() {
            for recon in view.refs.clear() {
                self.backend.release_reconstructed(recon);
            }
        }

        self.backend.configure(&seq.context)?;

        self.views = (0..seq.num_views())
            .map(|view_idx| ViewState::new(&seq, view_idx))
            .collect();
        self.config = config;
        self.seq = seq;
        self.config_changed = true;
        self.frame_counter = 0;

        Ok(())
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Resolved parameters of the current sequence.
    pub fn sequence(&self) -> &SequenceParams {
        &self.seq
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Decoder configuration record of the base view.
    pub fn codec_data(&self) -> EncodeResult<Vec<u8>> {
        let base = self.views.first().ok_or(EncodeError::InvalidInternalState)?;
        let sps = pack_sps(&base.headers.sps)?;
        let pps = pack_pps(&base.headers.pps)?;

        Ok(avc_decoder_configuration_record(&sps.data, &pps.data)?)
    }

    /// Number of frames held by the reorder pools.
    pub fn pending_frames(&self) -> usize {
        self.views.iter().map(|view| view.reorder.len()).sum()
    }

    /// Accepts the next display order frame. Frames are spread over the views in turn.
    pub fn submit_frame(
        &mut self,
        picture: B::Picture,
        meta: FrameMetadata,
    ) -> EncodeResult<SubmitOutcome> {
        let num_views = self.views.len().max(1) as u64;
        let view_idx = (self.frame_counter % num_views) as usize;
        let view = self
            .views
            .get_mut(view_idx)
            .ok_or(EncodeError::InvalidInternalState)?;

        self.started = true;
        self.frame_counter += 1;

        let force_keyframe = meta.force_keyframe;
        let frame = InputFrame { picture, meta };

        let Some(picture) = view.reorder.push(frame, force_keyframe, &self.seq.gop) else {
            trace!("view {} holds {} frames", view_idx, view.reorder.len());
            return Ok(SubmitOutcome::Backpressure);
        };

        let mut pictures = vec![picture];
        self.drain_views(view_idx, &mut pictures);

        self.encode_pictures(pictures).map(SubmitOutcome::Submitted)
    }

    /// Pops draining pictures one view at a time, starting with the view after `view_idx`,
    /// until a view has nothing ready. Keeps the views of an MVC stream in lockstep.
    fn drain_views(
        &mut self,
        view_idx: usize,
        pictures: &mut Vec<Picture<InputFrame<B::Picture>>>,
    ) {
        let num_views = self.views.len();
        let mut next = view_idx;

        loop {
            next = (next + 1) % num_views;
            let Some(view) = self.views.get_mut(next) else {
                break;
            };

            match view.reorder.pop_draining(&self.seq.gop) {
                Some(picture) => pictures.push(picture),
                None => break,
            }
        }
    }

    /// Encodes every held frame and ends the IDR period. The next submitted frame is an IDR
    /// picture of the base view and the configuration may change again.
    pub fn flush(&mut self) -> EncodeResult<Vec<PictureInfo>> {
        let num_views = self.views.len();
        let first = (self.frame_counter % num_views.max(1) as u64) as usize;
        let mut pictures = Vec::with_capacity(self.pending_frames());

        let mut per_view: Vec<_> = self
            .views
            .iter_mut()
            .map(|view| view.reorder.flush(&self.seq.gop).into_iter())
            .collect();

        // Views are interleaved, starting with the one expecting the next input frame.
        let mut exhausted = 0;
        let mut next = first;
        while exhausted < num_views {
            exhausted = 0;
            for _ in 0..num_views {
                match per_view.get_mut(next).and_then(Iterator::next) {
                    Some(picture) => pictures.push(picture),
                    None => exhausted += 1,
                }
                next = (next + 1) % num_views;
            }
        }

        debug!("flushing {} pictures", pictures.len());

        self.started = false;
        self.frame_counter = 0;

        self.encode_pictures(pictures)
    }

    /// Encodes `pictures` in order. A failing picture does not prevent the next ones from being
    /// submitted, the first error is returned.
    fn encode_pictures(
        &mut self,
        pictures: Vec<Picture<InputFrame<B::Picture>>>,
    ) -> EncodeResult<Vec<PictureInfo>> {
        let mut infos = Vec::with_capacity(pictures.len());
        let mut result = Ok(());

        for picture in pictures {
            let info = picture.info();
            match self.encode_picture(picture) {
                Ok(()) => infos.push(info),
                Err(e) => {
                    error!("failed to encode {:?} picture poc={}: {}", info.type_, info.poc, e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }

        result.map(|()| infos)
    }

    fn encode_picture(&mut self, picture: Picture<InputFrame<B::Picture>>) -> EncodeResult<()> {
        let info = picture.info();
        let Picture {
            frame: InputFrame { picture: input, meta },
            ..
        } = picture;

        let seq = &self.seq;
        let view = self
            .views
            .get_mut(info.view_idx)
            .ok_or(EncodeError::InvalidInternalState)?;

        let lists = view.refs.build_lists(&info)?;
        let slices = build_slices(seq, &view.headers, &info, &lists);
        let PictureHeaders {
            packed: packed_headers,
            new_sequence,
            has_sei,
        } = build_packed_headers(
            seq,
            &view.headers,
            &view.reorder,
            &info,
            &slices,
            self.config_changed,
        )?;

        let recon = self.backend.new_reconstructed()?;

        trace!(
            "submitting {:?} poc={} frame_num={} view={} refs={}/{} headers={}",
            info.type_,
            info.poc,
            info.frame_num,
            info.view_idx,
            lists.list0.len(),
            lists.list1.len(),
            packed_headers.len()
        );

        let request = BackendRequest {
            input,
            input_meta: meta.clone(),
            sps: Rc::clone(view.headers.active_sps()),
            pps: Rc::clone(&view.headers.pps),
            new_sequence,
            picture: info,
            slices,
            ref_lists: lists,
            reference_frames: view.refs.iter().collect(),
            recon: &recon,
            packed_headers,
            rate_control: seq.rate_control_params,
            coded_output: Vec::new(),
        };

        let bitstream = match self.backend.encode_picture(request) {
            Ok(bitstream) => bitstream,
            Err(e) => {
                self.backend.release_reconstructed(recon);
                return Err(e.into());
            }
        };

        if new_sequence && info.view_idx + 1 >= seq.num_views() {
            self.config_changed = false;
        }
        if has_sei {
            view.reorder.next_frame_count(info.is_idr);
        }

        for released in view.refs.update(&info, recon) {
            self.backend.release_reconstructed(released);
        }

        self.output_queue
            .add_promise(BitstreamPromise { bitstream, meta });

        Ok(())
    }

    fn poll_pending(&mut self, mode: BlockingMode) -> EncodeResult<()> {
        while let Some(coded) = self.output_queue.poll(mode)? {
            self.coded_queue.push_back(coded);
        }

        Ok(())
    }
}

impl<H, B> StatelessVideoEncoder<H> for StatelessEncoder<H, B>
where
    B: StatelessH264EncoderBackend,
    B: StatelessEncoderBackendImport<H, B::Picture>,
{
    fn encode(&mut self, metadata: FrameMetadata, handle: H) -> EncodeResult<()> {
        log::trace!(
            "encode: timestamp={} force_keyframe={}",
            metadata.timestamp,
            metadata.force_keyframe
        );

        // Import `handle` to backends representation
        let picture = self.backend.import_picture(&metadata, handle)?;
        self.submit_frame(picture, metadata)?;

        Ok(())
    }

    fn drain(&mut self) -> EncodeResult<()> {
        log::trace!("currently reorder pools hold {}", self.pending_frames());

        self.flush()?;
        while !self.output_queue.is_empty() {
            self.poll_pending(BlockingMode::Blocking)?;
        }

        Ok(())
    }

    fn poll(&mut self) -> EncodeResult<Option<CodedBitstreamBuffer>> {
        // Poll on output queue without blocking and try to dequeue from coded queue
        self.poll_pending(BlockingMode::NonBlocking)?;
        Ok(self.coded_queue.pop_front())
    }
}

impl<H, B> Drop for StatelessEncoder<H, B>
where
    B: StatelessH264EncoderBackend,
{
    fn drop(&mut self) {
        if self.pending_frames() > 0 {
            if let Err(e) = self.flush() {
                error!("failed to flush the encoder on drop: {}", e);
            }
        }

        for view in self.views.iter_mut() {
            for recon in view.refs.clear() {
                self.backend.release_reconstructed(recon);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::Backend;
    use crate::backend::dummy::Capabilities;
    use crate::backend::dummy::FAKE_SLICE_DATA;
    use crate::codec::h264::syntax::SliceType;
    use crate::encoder::stateless::h264::params::build_sps;
    use crate::encoder::stateless::simple_encode_loop;
    use crate::encoder::stateless::StatelessBackendError;
    use crate::encoder::PackedHeaderType;
    use crate::encoder::RateControl;
    use crate::Resolution;

    type Encoder = StatelessEncoder<u64, Backend>;

    fn meta(timestamp: u64) -> FrameMetadata {
        FrameMetadata {
            timestamp,
            display_resolution: Resolution {
                width: 320,
                height: 240,
            },
            force_keyframe: false,
        }
    }

    fn encoder(config: EncoderConfig) -> Encoder {
        let _ = env_logger::try_init();

        StatelessEncoder::new(
            Backend::new(Capabilities::default()),
            config,
            BlockingMode::Blocking,
        )
        .unwrap()
    }

    fn submit(encoder: &mut Encoder, frame: u64) -> SubmitOutcome {
        encoder.submit_frame(frame, meta(frame)).unwrap()
    }

    fn header_types(encoder: &Encoder, index: usize) -> Vec<PackedHeaderType> {
        encoder.backend().submitted[index].header_types.clone()
    }

    #[test]
    fn encode_loop_low_delay() {
        let mut encoder = encoder(EncoderConfig::default());

        let mut frames = (0..5u64).map(|i| (meta(i), i));
        let mut coded = Vec::new();
        simple_encode_loop(&mut encoder, &mut frames, |buffer| coded.push(buffer)).unwrap();

        let timestamps: Vec<_> = coded.iter().map(|c| c.metadata.timestamp).collect();
        assert_eq!(timestamps, vec![0, 1, 2, 3, 4]);

        // SPS first, then P slices with nal_ref_idc 2.
        assert_eq!(coded[0].bitstream[..5], [0x00, 0x00, 0x00, 0x01, 0x67]);
        assert_eq!(coded[1].bitstream[..5], [0x00, 0x00, 0x00, 0x01, 0x41]);
        for buffer in &coded {
            assert!(buffer.bitstream.ends_with(&FAKE_SLICE_DATA));
        }

        let submitted = &encoder.backend().submitted;
        let types: Vec<_> = submitted.iter().map(|s| s.picture.type_).collect();
        assert_eq!(
            types,
            vec![
                SliceType::I,
                SliceType::P,
                SliceType::P,
                SliceType::P,
                SliceType::P
            ]
        );
        assert!(submitted[0].picture.is_idr && submitted[0].new_sequence);
        assert_eq!(
            header_types(&encoder, 0),
            vec![
                PackedHeaderType::Sequence,
                PackedHeaderType::Picture,
                PackedHeaderType::Slice
            ]
        );
        assert_eq!(header_types(&encoder, 1), vec![PackedHeaderType::Slice]);

        let submitted = &encoder.backend().submitted;
        assert_eq!(submitted[1].list0, vec![submitted[0].recon]);
        assert_eq!(submitted[2].list0, vec![submitted[1].recon]);
        assert_eq!(submitted[2].reference_frames, vec![submitted[1].recon]);
        assert_eq!(submitted[2].slices, vec![(0, 300)]);

        // Only the last reference is still held.
        assert_eq!(encoder.backend().live_surfaces(), 1);
    }

    #[test]
    fn b_frames_backpressure() {
        let mut encoder = encoder(EncoderConfig {
            num_bframes: 1,
            ..Default::default()
        });
        assert_eq!(encoder.sequence().profile, Profile::Main);

        let SubmitOutcome::Submitted(pictures) = submit(&mut encoder, 0) else {
            panic!("the IDR picture is never held");
        };
        assert_eq!(pictures.len(), 1);
        assert!(pictures[0].is_idr);

        assert_eq!(submit(&mut encoder, 1), SubmitOutcome::Backpressure);
        assert_eq!(encoder.pending_frames(), 1);

        let SubmitOutcome::Submitted(pictures) = submit(&mut encoder, 2) else {
            panic!("the anchor releases the group");
        };
        let order: Vec<_> = pictures.iter().map(|p| (p.type_, p.poc)).collect();
        assert_eq!(order, vec![(SliceType::P, 4), (SliceType::B, 2)]);
        assert_eq!(encoder.pending_frames(), 0);
        assert!(encoder.flush().unwrap().is_empty());

        let submitted = &encoder.backend().submitted;
        let inputs: Vec<_> = submitted.iter().map(|s| s.input).collect();
        assert_eq!(inputs, vec![0, 2, 1]);

        let b = &submitted[2];
        assert_eq!(b.list0, vec![submitted[0].recon]);
        assert_eq!(b.list1, vec![submitted[1].recon]);
        assert!(!b.picture.is_reference);

        // The B picture's surface went straight back.
        assert_eq!(encoder.backend().live_surfaces(), 2);
    }

    #[test]
    fn hrd_sei_and_aud() {
        let mut encoder = encoder(EncoderConfig {
            rate_control: RateControl::ConstantBitrate(Some(1000)),
            use_aud: true,
            ..Default::default()
        });

        for frame in 0..3 {
            submit(&mut encoder, frame);
        }

        assert_eq!(
            header_types(&encoder, 0),
            vec![
                PackedHeaderType::RawData,
                PackedHeaderType::Sequence,
                PackedHeaderType::Sei,
                PackedHeaderType::Picture,
                PackedHeaderType::Slice,
            ]
        );
        assert_eq!(
            header_types(&encoder, 1),
            vec![
                PackedHeaderType::RawData,
                PackedHeaderType::Sei,
                PackedHeaderType::Slice
            ]
        );

        let first = encoder.poll().unwrap().unwrap();
        assert_eq!(first.bitstream[..6], [0x00, 0x00, 0x00, 0x01, 0x09, 0x10]);
        let second = encoder.poll().unwrap().unwrap();
        assert_eq!(second.bitstream[..6], [0x00, 0x00, 0x00, 0x01, 0x09, 0x30]);
    }

    #[test]
    fn intra_pictures_repeat_pps_only() {
        let mut encoder = encoder(EncoderConfig {
            keyframe_period: 2,
            idr_period: 30,
            ..Default::default()
        });

        for frame in 0..4 {
            submit(&mut encoder, frame);
        }

        let intra = &encoder.backend().submitted[2];
        assert!(intra.picture.type_.is_i());
        assert!(!intra.picture.is_idr);
        assert!(!intra.new_sequence);
        assert_eq!(
            header_types(&encoder, 2),
            vec![PackedHeaderType::Picture, PackedHeaderType::Slice]
        );
    }

    #[test]
    fn forced_keyframe_is_idr() {
        let mut encoder = encoder(EncoderConfig::default());

        for frame in 0..4 {
            let mut meta = meta(frame);
            meta.force_keyframe = frame == 2;
            encoder.submit_frame(frame, meta).unwrap();
        }

        let submitted = &encoder.backend().submitted;
        let forced = &submitted[2];
        assert!(forced.picture.is_idr && forced.new_sequence);
        assert_eq!(forced.picture.idr_pic_id, 2);
        assert_eq!(forced.picture.poc, 0);
        assert_eq!(submitted[3].list0, vec![forced.recon]);
        assert_eq!(submitted[3].picture.frame_num, 1);
    }

    #[test]
    fn set_config_lifecycle() {
        let mut encoder = encoder(EncoderConfig::default());

        let cbr = EncoderConfig {
            rate_control: RateControl::ConstantBitrate(None),
            ..Default::default()
        };
        encoder.set_config(cbr.clone()).unwrap();
        assert!(encoder.sequence().has_hrd());

        submit(&mut encoder, 0);
        assert!(matches!(
            encoder.set_config(EncoderConfig::default()),
            Err(ConfigError::AlreadyStarted)
        ));
        assert_eq!(encoder.config().rate_control, cbr.rate_control);

        encoder.flush().unwrap();
        assert!(matches!(
            encoder.set_config(EncoderConfig {
                num_slices: 0,
                ..Default::default()
            }),
            Err(ConfigError::InvalidSliceCount(0))
        ));
        assert!(encoder.sequence().has_hrd());
        assert_eq!(encoder.backend().live_surfaces(), 1);

        encoder.set_config(EncoderConfig::default()).unwrap();
        assert!(!encoder.sequence().has_hrd());
        assert_eq!(encoder.backend().live_surfaces(), 0);

        // The new sequence starts with an IDR picture.
        submit(&mut encoder, 1);
        let last = encoder.backend().submitted.last().unwrap();
        assert!(last.picture.is_idr && last.new_sequence);
    }

    #[test]
    fn backend_failure_releases_surface() {
        let mut encoder = encoder(EncoderConfig::default());
        submit(&mut encoder, 0);

        encoder.backend_mut().fail_next_picture();
        assert!(matches!(
            encoder.submit_frame(1, meta(1)),
            Err(EncodeError::BackendError(StatelessBackendError::Other(_)))
        ));
        assert_eq!(encoder.backend().live_surfaces(), 1);

        // The session keeps going with the references it has.
        submit(&mut encoder, 2);
        let submitted = &encoder.backend().submitted;
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[1].input, 2);
        assert_eq!(submitted[1].list0, vec![submitted[0].recon]);
        assert_eq!(encoder.backend().live_surfaces(), 1);
    }

    #[test]
    fn failed_idr_keeps_sequence_headers_pending() {
        let mut encoder = encoder(EncoderConfig {
            keyframe_period: 2,
            idr_period: 30,
            ..Default::default()
        });

        encoder.backend_mut().fail_next_picture();
        assert!(encoder.submit_frame(0, meta(0)).is_err());
        // Nothing to predict from.
        assert!(encoder.submit_frame(1, meta(1)).is_err());
        submit(&mut encoder, 2);

        let intra = &encoder.backend().submitted[0];
        assert_eq!(intra.input, 2);
        assert!(!intra.picture.is_idr);
        assert!(intra.new_sequence);
        assert_eq!(
            header_types(&encoder, 0),
            vec![
                PackedHeaderType::Sequence,
                PackedHeaderType::Picture,
                PackedHeaderType::Slice,
            ]
        );
    }

    #[test]
    fn failed_picture_keeps_timing_counter() {
        let mut encoder = encoder(EncoderConfig {
            rate_control: RateControl::ConstantBitrate(Some(1000)),
            ..Default::default()
        });

        submit(&mut encoder, 0);
        encoder.backend_mut().fail_next_picture();
        assert!(encoder.submit_frame(1, meta(1)).is_err());
        submit(&mut encoder, 2);

        let seq = encoder.sequence().clone();
        let info = encoder.backend().submitted[1].picture;
        let sps = build_sps(&seq);
        let expected = pack_sei(&build_sei(&seq, &sps, &info, 1)).unwrap();
        let skewed = pack_sei(&build_sei(&seq, &sps, &info, 2)).unwrap();

        encoder.poll().unwrap().unwrap();
        let coded = encoder.poll().unwrap().unwrap();
        assert_eq!(coded.metadata.timestamp, 2);
        let contains = |data: &[u8]| {
            coded
                .bitstream
                .windows(data.len())
                .any(|window| window == data)
        };
        assert!(contains(&expected.data));
        assert!(!contains(&skewed.data));
    }

    #[test]
    fn mvc_two_views() {
        let mut encoder = encoder(EncoderConfig {
            num_views: 2,
            ..Default::default()
        });
        assert_eq!(encoder.sequence().profile, Profile::StereoHigh);
        assert_eq!(encoder.backend().context().unwrap().num_surfaces, 8);

        let mut coded = Vec::new();
        for frame in 0..4 {
            submit(&mut encoder, frame);
            coded.push(encoder.poll().unwrap().unwrap());
        }

        let submitted = &encoder.backend().submitted;
        let views: Vec<_> = submitted.iter().map(|s| s.picture.view_idx).collect();
        assert_eq!(views, vec![0, 1, 0, 1]);
        assert!(submitted[0].picture.is_idr && submitted[1].picture.is_idr);
        assert_eq!((submitted[0].sps_id, submitted[0].pps_id), (0, 0));
        assert_eq!((submitted[1].sps_id, submitted[1].pps_id), (1, 1));
        assert_eq!(submitted[2].list0, vec![submitted[0].recon]);
        assert_eq!(submitted[3].list0, vec![submitted[1].recon]);

        assert_eq!(
            header_types(&encoder, 0),
            vec![
                PackedHeaderType::Sequence,
                PackedHeaderType::Picture,
                PackedHeaderType::RawData,
                PackedHeaderType::Slice,
            ]
        );
        assert_eq!(
            header_types(&encoder, 2),
            vec![PackedHeaderType::RawData, PackedHeaderType::Slice]
        );

        // Prefix NAL unit ahead of the base view slice.
        assert_eq!(coded[2].bitstream[..5], [0x00, 0x00, 0x00, 0x01, 0x4e]);
        // Subset SPS, then a slice extension of the second view.
        assert_eq!(coded[1].bitstream[..5], [0x00, 0x00, 0x00, 0x01, 0x6f]);
        assert_eq!(coded[3].bitstream[..5], [0x00, 0x00, 0x00, 0x01, 0x54]);

        // The base view is signalled as High.
        let codec_data = encoder.codec_data().unwrap();
        assert_eq!(codec_data[1], 100);
    }

    #[test]
    fn mvc_b_frames_interleave_views() {
        let mut encoder = encoder(EncoderConfig {
            num_views: 2,
            num_bframes: 2,
            ..Default::default()
        });

        for frame in 0..8 {
            submit(&mut encoder, frame);
        }

        let coding_order = |encoder: &Encoder| -> Vec<_> {
            encoder
                .backend()
                .submitted
                .iter()
                .map(|s| (s.picture.view_idx, s.input, s.picture.type_))
                .collect()
        };

        assert_eq!(
            coding_order(&encoder),
            vec![
                (0, 0, SliceType::I),
                (1, 1, SliceType::I),
                (0, 6, SliceType::P),
                (1, 7, SliceType::P),
                (0, 2, SliceType::B),
                (1, 3, SliceType::B),
                (0, 4, SliceType::B),
                (1, 5, SliceType::B),
            ]
        );

        for frame in 8..12 {
            assert_eq!(submit(&mut encoder, frame), SubmitOutcome::Backpressure);
        }

        let flushed = encoder.flush().unwrap();
        let views: Vec<_> = flushed.iter().map(|pic| pic.view_idx).collect();
        assert_eq!(views, vec![0, 1, 0, 1]);
        assert_eq!(
            coding_order(&encoder)[8..],
            [
                (0, 10, SliceType::P),
                (1, 11, SliceType::P),
                (0, 8, SliceType::B),
                (1, 9, SliceType::B),
            ]
        );
        assert_eq!(encoder.pending_frames(), 0);
    }

    #[test]
    fn hierarchical_b_session() {
        let mut encoder = encoder(EncoderConfig {
            temporal_levels: 3,
            num_bframes: 1,
            ..Default::default()
        });
        let num_surfaces = encoder.backend().context().unwrap().num_surfaces as usize;

        for frame in 0..9 {
            submit(&mut encoder, frame);
            assert!(encoder.backend().live_surfaces() <= num_surfaces);
        }

        let inputs: Vec<_> = encoder.backend().submitted.iter().map(|s| s.input).collect();
        assert_eq!(inputs, vec![0, 4, 2, 1, 3, 8, 6, 5, 7]);

        let submitted = &encoder.backend().submitted;
        // B1 predicts from the IDR and B2.
        assert_eq!(submitted[3].list0, vec![submitted[0].recon]);
        assert_eq!(submitted[3].list1, vec![submitted[2].recon]);
    }

    #[test]
    fn flush_emits_held_frames() {
        let mut encoder = encoder(EncoderConfig {
            num_bframes: 2,
            ..Default::default()
        });

        submit(&mut encoder, 0);
        assert_eq!(submit(&mut encoder, 1), SubmitOutcome::Backpressure);
        assert_eq!(submit(&mut encoder, 2), SubmitOutcome::Backpressure);

        let flushed: Vec<_> = encoder
            .flush()
            .unwrap()
            .iter()
            .map(|p| (p.type_, p.poc))
            .collect();
        assert_eq!(flushed, vec![(SliceType::P, 4), (SliceType::B, 2)]);
        assert_eq!(encoder.pending_frames(), 0);

        let SubmitOutcome::Submitted(pictures) = submit(&mut encoder, 3) else {
            panic!("a new IDR period starts after a flush");
        };
        assert!(pictures[0].is_idr);
    }

    #[test]
    fn deterministic_output() {
        let config = EncoderConfig {
            resolution: Resolution {
                width: 1920,
                height: 1080,
            },
            rate_control: RateControl::VariableBitrate(None),
            num_bframes: 2,
            num_slices: 4,
            use_cabac: true,
            use_dct8x8: true,
            ..Default::default()
        };

        let run = || {
            let mut encoder = encoder(config.clone());
            let mut frames = (0..12u64).map(|i| (meta(i), i));
            let mut stream = Vec::new();
            simple_encode_loop(&mut encoder, &mut frames, |buffer| {
                stream.extend_from_slice(&buffer.bitstream)
            })
            .unwrap();

            assert_eq!(encoder.sequence().profile, Profile::High);
            let slices = &encoder.backend().submitted[0].slices;
            assert_eq!(slices, &vec![(0, 2040), (2040, 2040), (4080, 2040), (6120, 2040)]);
            stream
        };

        let first = run();
        assert!(!first.is_empty());
        assert_eq!(first, run());
    }

    #[test]
    fn codec_data_record() {
        let encoder = encoder(EncoderConfig::default());
        let record = encoder.codec_data().unwrap();

        assert_eq!(record[..6], [0x01, 66, 0xc0, 13, 0xff, 0xe1]);
        let sps_len = u16::from_be_bytes([record[6], record[7]]) as usize;
        assert_eq!(record[8], 0x67);
        assert_eq!(record[8 + sps_len], 1);
        assert_eq!(record[8 + sps_len + 3], 0x68);
    }
}
