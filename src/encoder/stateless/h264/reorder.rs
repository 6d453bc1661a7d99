// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GOP state machine turning display order frames into coding order pictures.

use std::collections::VecDeque;

use log::trace;

use crate::codec::h264::syntax::SliceType;
use crate::encoder::h264::PredictionType;
use crate::encoder::stateless::h264::gop::GopParams;

/// A frame accepted by a [`ReorderPool`], tagged with its coding decisions.
#[derive(Debug)]
pub struct Picture<F> {
    /// The input frame.
    pub frame: F,
    pub type_: SliceType,
    /// Picture order count, wrapping at [`GopParams::max_pic_order_cnt`].
    pub poc: u32,
    /// Wraps at [`GopParams::max_frame_num`]. Only assigned when the picture leaves the pool.
    pub frame_num: u32,
    pub temporal_id: u8,
    pub is_idr: bool,
    pub is_reference: bool,
    pub view_idx: usize,
    /// `idr_pic_id` of the slices of the picture.
    pub idr_pic_id: u16,
}

impl<F> Picture<F> {
    fn new(frame: F, view_idx: usize) -> Self {
        Self {
            frame,
            // Placeholder until the picture is marked.
            type_: SliceType::P,
            poc: 0,
            frame_num: 0,
            temporal_id: 0,
            is_idr: false,
            is_reference: false,
            view_idx,
            idr_pic_id: 0,
        }
    }

    fn set_b_frame(&mut self, gop: &GopParams) {
        self.type_ = SliceType::B;
        self.is_reference = gop.temporal_levels > 1 && !gop.is_temporal_id_max(self.temporal_id);
    }

    fn set_p_frame(&mut self, gop: &GopParams) {
        self.type_ = SliceType::P;
        self.is_reference = gop.temporal_levels == 1 || !gop.is_temporal_id_max(self.temporal_id);
    }

    /// Turns the picture into the base layer anchor of a hierarchical-B group.
    fn set_base_layer_p_frame(&mut self, gop: &GopParams) {
        self.set_p_frame(gop);
        if gop.prediction_type == PredictionType::HierarchicalB {
            self.temporal_id = 0;
            self.is_reference = true;
        }
    }

    fn set_i_frame(&mut self) {
        self.type_ = SliceType::I;
        self.is_reference = true;
    }

    fn set_idr_frame(&mut self, idr_pic_id: u16) {
        self.set_i_frame();
        self.poc = 0;
        self.is_idr = true;
        self.idr_pic_id = idr_pic_id;
    }

    pub fn info(&self) -> PictureInfo {
        PictureInfo {
            type_: self.type_,
            poc: self.poc,
            frame_num: self.frame_num,
            temporal_id: self.temporal_id,
            is_idr: self.is_idr,
            is_reference: self.is_reference,
            view_idx: self.view_idx,
            idr_pic_id: self.idr_pic_id,
        }
    }
}

/// Coding decisions of a [`Picture`], without the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PictureInfo {
    pub type_: SliceType,
    pub poc: u32,
    pub frame_num: u32,
    pub temporal_id: u8,
    pub is_idr: bool,
    pub is_reference: bool,
    pub view_idx: usize,
    pub idr_pic_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderState {
    /// No B-frames, every picture leaves the pool when it is pushed.
    Idle,
    /// Gathering the pictures preceding the next anchor.
    Collecting,
    /// Emitting the gathered pictures, no new input is expected.
    Draining,
}

/// Per view reorder queue and counters.
pub struct ReorderPool<F> {
    view_idx: usize,
    queue: VecDeque<Picture<F>>,
    state: ReorderState,
    /// Position within the IDR period.
    frame_index: u32,
    cur_frame_num: u32,
    /// Display order index within the IDR period, drives the POC.
    cur_present_index: u32,
    idr_num: u16,
    /// Pictures since the last IDR, for the picture timing SEI.
    frame_count: u32,
}

impl<F> ReorderPool<F> {
    pub fn new(view_idx: usize) -> Self {
        Self {
            view_idx,
            queue: Default::default(),
            state: ReorderState::Idle,
            frame_index: 0,
            cur_frame_num: 0,
            cur_present_index: 0,
            idr_num: 0,
            frame_count: 0,
        }
    }

    pub fn state(&self) -> ReorderState {
        self.state
    }

    /// Number of pictures held.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn reset_gop_start(&mut self) {
        self.frame_index = 1;
        self.cur_present_index = 0;
        self.idr_num = self.idr_num.wrapping_add(1);
    }

    fn set_key_frame(&mut self, picture: &mut Picture<F>, is_idr: bool) {
        if is_idr {
            self.reset_gop_start();
            picture.set_idr_frame(self.idr_num);
        } else {
            picture.set_i_frame();
        }
    }

    /// Assigns `frame_num`. Only reference pictures advance the counter.
    fn set_frame_num(&mut self, picture: &mut Picture<F>, gop: &GopParams) {
        picture.frame_num = self.cur_frame_num % gop.max_frame_num();

        if picture.is_idr {
            picture.frame_num = 0;
            self.cur_frame_num = 0;
        }

        if picture.is_reference {
            self.cur_frame_num += 1;
        }
    }

    fn output(&mut self, mut picture: Picture<F>, gop: &GopParams) -> Picture<F> {
        self.set_frame_num(&mut picture, gop);

        trace!(
            "view {} output {:?} poc={} frame_num={} temporal_id={} ref={} idr={} queued={}",
            self.view_idx,
            picture.type_,
            picture.poc,
            picture.frame_num,
            picture.temporal_id,
            picture.is_reference,
            picture.is_idr,
            self.queue.len()
        );

        picture
    }

    fn sort_hierarchical_b(&mut self, gop: &GopParams) {
        if gop.prediction_type == PredictionType::HierarchicalB {
            self.queue
                .make_contiguous()
                .sort_by_key(|pic| (!pic.type_.is_b(), pic.temporal_id, pic.poc));
        }
    }

    /// Accepts the next display order frame. Returns the next picture in coding order, or `None`
    /// when more frames are needed before one can be emitted.
    ///
    /// After a picture is returned, [`Self::pop_draining`] must be called until it returns `None`
    /// before the next frame is pushed.
    pub fn push(&mut self, frame: F, force_keyframe: bool, gop: &GopParams) -> Option<Picture<F>> {
        let mut picture = Picture::new(frame, self.view_idx);

        self.cur_present_index += 1;
        picture.poc = (self.cur_present_index * 2) % gop.max_pic_order_cnt();
        picture.temporal_id = gop.temporal_id(self.frame_index);

        let is_idr = self.frame_index == 0 || self.frame_index >= gop.idr_period;

        if is_idr || force_keyframe || self.frame_index % gop.keyframe_period == 0 {
            self.frame_index += 1;

            if gop.num_bframes > 0 && !self.queue.is_empty() {
                let mut p_pic = self.queue.pop_back()?;
                p_pic.set_base_layer_p_frame(gop);

                for pic in self.queue.iter_mut() {
                    pic.set_b_frame(gop);
                }

                self.set_key_frame(&mut picture, is_idr || force_keyframe);
                self.queue.push_back(picture);
                self.state = ReorderState::Draining;

                return Some(self.output(p_pic, gop));
            }

            self.set_key_frame(&mut picture, is_idr || force_keyframe);
            if gop.num_bframes > 0 {
                self.state = ReorderState::Collecting;
            }

            return Some(self.output(picture, gop));
        }

        self.frame_index += 1;

        if self.state == ReorderState::Collecting && self.queue.len() < gop.num_bframes as usize {
            self.queue.push_back(picture);
            return None;
        }

        picture.set_p_frame(gop);

        if self.state == ReorderState::Collecting {
            for pic in self.queue.iter_mut() {
                pic.set_b_frame(gop);
            }

            if !self.queue.is_empty() {
                self.state = ReorderState::Draining;
            }
        }

        Some(self.output(picture, gop))
    }

    /// Returns the next held picture while draining.
    pub fn pop_draining(&mut self, gop: &GopParams) -> Option<Picture<F>> {
        if self.state != ReorderState::Draining {
            return None;
        }

        self.sort_hierarchical_b(gop);

        let picture = self.queue.pop_front()?;
        if self.queue.is_empty() {
            self.state = ReorderState::Collecting;
        }

        Some(self.output(picture, gop))
    }

    /// Emits every held picture, the most recent one as P and the others as B, and resets the
    /// pool so that the next frame starts a new IDR period.
    pub fn flush(&mut self, gop: &GopParams) -> Vec<Picture<F>> {
        let mut pictures = Vec::with_capacity(self.queue.len());

        // Pictures already typed are emitted as they are.
        while self.state == ReorderState::Draining {
            match self.pop_draining(gop) {
                Some(picture) => pictures.push(picture),
                None => break,
            }
        }

        if let Some(mut p_pic) = self.queue.pop_back() {
            p_pic.set_base_layer_p_frame(gop);

            for pic in self.queue.iter_mut() {
                pic.set_b_frame(gop);
            }
            self.sort_hierarchical_b(gop);

            pictures.push(self.output(p_pic, gop));
            while let Some(picture) = self.queue.pop_front() {
                pictures.push(self.output(picture, gop));
            }
        }

        self.frame_index = 0;
        self.cur_frame_num = 0;
        self.cur_present_index = 0;
        self.state = ReorderState::Idle;

        pictures
    }

    /// Advances the picture counter of the timing SEI and returns it.
    pub fn next_frame_count(&mut self, is_idr: bool) -> u32 {
        self.frame_count = self.peek_frame_count(is_idr);
        self.frame_count
    }

    /// Picture counter the timing SEI of the next picture carries, without advancing it.
    pub fn peek_frame_count(&self, is_idr: bool) -> u32 {
        if is_idr {
            0
        } else {
            self.frame_count.wrapping_add(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::h264::EncoderConfig;
    use crate::encoder::stateless::h264::negotiate::HardwareCaps;
    use crate::encoder::stateless::h264::negotiate::ToolSet;
    use crate::encoder::stateless::h264::references::poc_greater_than;

    fn gop(config: EncoderConfig) -> GopParams {
        let tools = ToolSet {
            use_cabac: config.use_cabac,
            use_dct8x8: config.use_dct8x8,
            num_bframes: config.num_bframes,
            num_views: config.num_views,
        };
        let caps = HardwareCaps {
            max_profile_idc: 100,
            encoders: Vec::new(),
            max_reflist0_count: 4,
            max_reflist1_count: 1,
        };

        GopParams::derive(&config, &tools, 300, &caps).unwrap()
    }

    /// Pushes `frames` and collects every emitted picture as (frame, type, poc, frame_num).
    fn run(
        pool: &mut ReorderPool<u32>,
        gop: &GopParams,
        frames: std::ops::Range<u32>,
        forced: &[u32],
    ) -> Vec<(u32, SliceType, u32, u32)> {
        let mut out = Vec::new();
        for frame in frames {
            if let Some(pic) = pool.push(frame, forced.contains(&frame), gop) {
                out.push((pic.frame, pic.type_, pic.poc, pic.frame_num));
                while let Some(pic) = pool.pop_draining(gop) {
                    out.push((pic.frame, pic.type_, pic.poc, pic.frame_num));
                }
            }
            assert!(pool.len() <= gop.num_bframes as usize);
        }
        out
    }

    #[test]
    fn low_delay() {
        let gop = gop(EncoderConfig::default());
        let mut pool = ReorderPool::new(0);

        let out = run(&mut pool, &gop, 0..4, &[]);
        assert_eq!(
            out,
            vec![
                (0, SliceType::I, 0, 0),
                (1, SliceType::P, 2, 1),
                (2, SliceType::P, 4, 2),
                (3, SliceType::P, 6, 3),
            ]
        );
        assert_eq!(pool.state(), ReorderState::Idle);
    }

    #[test]
    fn b_frames() {
        let gop = gop(EncoderConfig {
            num_bframes: 2,
            ..Default::default()
        });
        let mut pool = ReorderPool::new(0);

        assert!(pool.push(0, false, &gop).is_some());
        assert_eq!(pool.state(), ReorderState::Collecting);
        assert!(pool.push(1, false, &gop).is_none());
        assert!(pool.push(2, false, &gop).is_none());
        assert_eq!(pool.len(), 2);

        let pic = pool.push(3, false, &gop).unwrap();
        assert_eq!((pic.frame, pic.type_, pic.poc), (3, SliceType::P, 6));
        assert!(pic.is_reference);
        assert_eq!(pool.state(), ReorderState::Draining);

        let b1 = pool.pop_draining(&gop).unwrap();
        let b2 = pool.pop_draining(&gop).unwrap();
        assert!(pool.pop_draining(&gop).is_none());
        assert_eq!(pool.state(), ReorderState::Collecting);

        assert_eq!((b1.frame, b1.type_, b1.poc, b1.frame_num), (1, SliceType::B, 2, 2));
        assert_eq!((b2.frame, b2.type_, b2.poc, b2.frame_num), (2, SliceType::B, 4, 2));
        assert!(!b1.is_reference && !b2.is_reference);

        // The next reference reuses the frame_num the B pictures carried.
        assert!(pool.push(4, false, &gop).is_none());
        assert!(pool.push(5, false, &gop).is_none());
        let pic = pool.push(6, false, &gop).unwrap();
        assert_eq!(pic.frame_num, 2);
    }

    #[test]
    fn keyframe_closes_pending_group() {
        let gop = gop(EncoderConfig {
            keyframe_period: 8,
            idr_period: 16,
            num_bframes: 3,
            ..Default::default()
        });
        let mut pool = ReorderPool::new(0);

        let order: Vec<_> = run(&mut pool, &gop, 0..9, &[])
            .into_iter()
            .map(|(frame, type_, ..)| (frame, type_))
            .collect();

        assert_eq!(
            order,
            vec![
                (0, SliceType::I),
                (4, SliceType::P),
                (1, SliceType::B),
                (2, SliceType::B),
                (3, SliceType::B),
                (7, SliceType::P),
                (5, SliceType::B),
                (6, SliceType::B),
                (8, SliceType::I),
            ]
        );
    }

    #[test]
    fn idr_period_and_forced_keyframes() {
        let gop = gop(EncoderConfig {
            keyframe_period: 4,
            idr_period: 8,
            ..Default::default()
        });
        let mut pool = ReorderPool::new(0);

        let mut idrs = Vec::new();
        let mut intras = Vec::new();
        for frame in 0..20 {
            let pic = pool.push(frame, frame == 10, &gop).unwrap();
            if pic.is_idr {
                assert_eq!((pic.poc, pic.frame_num), (0, 0));
                idrs.push((frame, pic.idr_pic_id));
            } else if pic.type_.is_i() {
                intras.push(frame);
            }
        }

        assert_eq!(idrs, vec![(0, 1), (8, 2), (10, 3), (18, 4)]);
        assert_eq!(intras, vec![4, 14]);
    }

    #[test]
    fn forced_keyframe_after_idr_restarts_poc() {
        let gop = gop(EncoderConfig::default());
        let mut pool = ReorderPool::new(0);

        let out = run(&mut pool, &gop, 0..5, &[3]);
        let pocs: Vec<_> = out.iter().map(|(_, _, poc, _)| *poc).collect();
        assert_eq!(pocs, vec![0, 2, 4, 0, 2]);
    }

    #[test]
    fn flush_pending() {
        let gop = gop(EncoderConfig {
            num_bframes: 3,
            ..Default::default()
        });
        let mut pool = ReorderPool::new(0);

        assert!(pool.push(0, false, &gop).is_some());
        assert!(pool.push(1, false, &gop).is_none());
        assert!(pool.push(2, false, &gop).is_none());

        let flushed: Vec<_> = pool
            .flush(&gop)
            .into_iter()
            .map(|pic| (pic.frame, pic.type_, pic.poc, pic.frame_num))
            .collect();
        assert_eq!(
            flushed,
            vec![(2, SliceType::P, 4, 1), (1, SliceType::B, 2, 2)]
        );
        assert!(pool.is_empty());
        assert_eq!(pool.state(), ReorderState::Idle);

        // A new IDR period starts.
        let pic = pool.push(3, false, &gop).unwrap();
        assert!(pic.is_idr);
        assert_eq!(pool.state(), ReorderState::Collecting);

        assert!(ReorderPool::<u32>::new(0).flush(&gop).is_empty());
    }

    #[test]
    fn hierarchical_b() {
        let gop = gop(EncoderConfig {
            temporal_levels: 3,
            num_bframes: 1,
            ..Default::default()
        });
        let mut pool = ReorderPool::new(0);

        let mut out = Vec::new();
        for frame in 0..9 {
            if let Some(pic) = pool.push(frame, false, &gop) {
                out.push(pic);
                while let Some(pic) = pool.pop_draining(&gop) {
                    out.push(pic);
                }
            }
        }

        let summary: Vec<_> = out
            .iter()
            .map(|pic| {
                (
                    pic.frame,
                    pic.type_,
                    pic.temporal_id,
                    pic.is_reference,
                    pic.frame_num,
                )
            })
            .collect();

        assert_eq!(
            summary,
            vec![
                (0, SliceType::I, 0, true, 0),
                (4, SliceType::P, 0, true, 1),
                (2, SliceType::B, 1, true, 2),
                (1, SliceType::B, 2, false, 3),
                (3, SliceType::B, 2, false, 3),
                (8, SliceType::P, 0, true, 3),
                (6, SliceType::B, 1, true, 4),
                (5, SliceType::B, 2, false, 5),
                (7, SliceType::B, 2, false, 5),
            ]
        );
    }

    #[test]
    fn hierarchical_p() {
        let gop = gop(EncoderConfig {
            temporal_levels: 2,
            ..Default::default()
        });
        let mut pool = ReorderPool::new(0);

        let pics: Vec<_> = (0..5).filter_map(|f| pool.push(f, false, &gop)).collect();
        let summary: Vec<_> = pics
            .iter()
            .map(|pic| (pic.type_, pic.temporal_id, pic.is_reference))
            .collect();
        assert_eq!(
            summary,
            vec![
                (SliceType::I, 0, true),
                (SliceType::P, 1, false),
                (SliceType::P, 0, true),
                (SliceType::P, 1, false),
                (SliceType::P, 0, true),
            ]
        );
    }

    #[test]
    fn poc_wraps() {
        let gop = gop(EncoderConfig {
            keyframe_period: 1500,
            idr_period: 2000,
            ..Default::default()
        });
        assert_eq!(gop.max_pic_order_cnt(), 2048);

        let mut pool = ReorderPool::new(0);
        let pocs: Vec<_> = (0..1200)
            .map(|f| pool.push(f, false, &gop).unwrap().poc)
            .collect();

        assert!(pocs.iter().any(|poc| *poc < 100) && pocs[1100] < pocs[1000]);
        for pair in pocs.windows(2) {
            assert_eq!((pair[0] + 2) % gop.max_pic_order_cnt(), pair[1]);
            assert!(poc_greater_than(pair[1], pair[0], gop.max_pic_order_cnt()));
        }
    }

    #[test]
    fn frame_count() {
        let mut pool = ReorderPool::<u32>::new(0);
        assert_eq!(pool.next_frame_count(true), 0);
        assert_eq!(pool.peek_frame_count(false), 1);
        assert_eq!(pool.peek_frame_count(true), 0);
        assert_eq!(pool.next_frame_count(false), 1);
        assert_eq!(pool.next_frame_count(false), 2);
        assert_eq!(pool.next_frame_count(true), 0);
    }
}
