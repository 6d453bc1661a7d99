// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sliding window pool of reconstructed reference pictures and reference list construction.

use std::collections::VecDeque;

use thiserror::Error;

use crate::codec::h264::syntax::SliceType;
use crate::encoder::h264::PredictionType;
use crate::encoder::stateless::h264::gop::GopParams;
use crate::encoder::stateless::h264::reorder::PictureInfo;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("no reference available for {0:?} picture with poc {1}")]
    MissingReference(SliceType, u32),
}

pub type ReferenceResult<T> = Result<T, ReferenceError>;

/// Cyclic comparison of two POCs wrapping at `max_poc`, true when `a` follows `b`.
pub fn poc_greater_than(a: u32, b: u32, max_poc: u32) -> bool {
    (a.wrapping_sub(b) & (max_poc - 1)) < max_poc / 2
}

/// A reconstructed reference picture.
#[derive(Debug)]
pub struct ReferenceEntry<R> {
    pub surface: R,
    pub poc: u32,
    pub frame_num: u32,
    pub temporal_id: u8,
}

/// Reference lists of a picture, borrowing from the [`ReferencePool`].
#[derive(Debug)]
pub struct RefLists<'a, R> {
    pub list0: Vec<&'a ReferenceEntry<R>>,
    pub list1: Vec<&'a ReferenceEntry<R>>,
    /// Frame number distance to the single list 0 entry, hierarchical prediction only.
    pub abs_diff_pic_num_l0: u32,
    /// Frame number distance to the single list 1 entry, hierarchical-B only.
    pub abs_diff_pic_num_l1: u32,
}

impl<R> RefLists<'_, R> {
    pub fn empty() -> Self {
        Self {
            list0: Vec::new(),
            list1: Vec::new(),
            abs_diff_pic_num_l0: 0,
            abs_diff_pic_num_l1: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.list0.is_empty() && self.list1.is_empty()
    }
}

/// Per view reference pool. Entries are kept in coding order, the oldest at the head.
pub struct ReferencePool<R> {
    entries: VecDeque<ReferenceEntry<R>>,
    prediction_type: PredictionType,
    max_ref_frames: usize,
    max_reflist0_count: usize,
    max_reflist1_count: usize,
    max_frame_num: u32,
    max_pic_order_cnt: u32,
}

impl<R> ReferencePool<R> {
    pub fn new(gop: &GopParams) -> Self {
        Self {
            entries: VecDeque::with_capacity(gop.max_ref_frames as usize),
            prediction_type: gop.prediction_type,
            max_ref_frames: gop.max_ref_frames.max(1) as usize,
            max_reflist0_count: gop.max_reflist0_count as usize,
            max_reflist1_count: gop.max_reflist1_count as usize,
            max_frame_num: gop.max_frame_num(),
            max_pic_order_cnt: gop.max_pic_order_cnt(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_ref_frames(&self) -> usize {
        self.max_ref_frames
    }

    /// Entries from the oldest to the most recent.
    pub fn iter(&self) -> impl Iterator<Item = &ReferenceEntry<R>> {
        self.entries.iter()
    }

    /// Takes the reconstructed `surface` of a coded `picture`. Returns every surface the pool
    /// no longer needs, `surface` itself when the picture is not a reference.
    pub fn update(&mut self, picture: &PictureInfo, surface: R) -> Vec<R> {
        if !picture.is_reference {
            return vec![surface];
        }

        let mut released = Vec::new();
        if picture.is_idr {
            released.extend(self.entries.drain(..).map(|entry| entry.surface));
        } else if self.entries.len() >= self.max_ref_frames {
            released.extend(self.entries.pop_front().map(|entry| entry.surface));
        }

        self.entries.push_back(ReferenceEntry {
            surface,
            poc: picture.poc,
            frame_num: picture.frame_num,
            temporal_id: picture.temporal_id,
        });

        debug_assert!(self.entries.len() <= self.max_ref_frames);
        released
    }

    /// Empties the pool, returning every held surface.
    pub fn clear(&mut self) -> Vec<R> {
        self.entries.drain(..).map(|entry| entry.surface).collect()
    }

    /// Frame number distance from `picture` to `entry`, modulo `MaxFrameNum`.
    fn pic_num_diff(&self, picture: &PictureInfo, entry: &ReferenceEntry<R>) -> u32 {
        (picture.frame_num + self.max_frame_num - entry.frame_num % self.max_frame_num)
            % self.max_frame_num
    }

    /// Builds the reference lists of `picture`, truncated to the list sizes of the pool.
    pub fn build_lists(&self, picture: &PictureInfo) -> ReferenceResult<RefLists<'_, R>> {
        let mut lists = if picture.type_.is_i() {
            RefLists::empty()
        } else if self.prediction_type == PredictionType::Default {
            self.default_lists(picture)?
        } else {
            self.hierarchical_lists(picture)?
        };

        lists.list0.truncate(self.max_reflist0_count);
        lists.list1.truncate(self.max_reflist1_count);
        Ok(lists)
    }

    fn default_lists(&self, picture: &PictureInfo) -> ReferenceResult<RefLists<'_, R>> {
        let split = self
            .entries
            .iter()
            .rposition(|entry| poc_greater_than(picture.poc, entry.poc, self.max_pic_order_cnt))
            .ok_or(ReferenceError::MissingReference(picture.type_, picture.poc))?;

        let mut lists = RefLists::empty();
        lists.list0 = self.entries.range(..=split).rev().collect();

        if picture.type_.is_b() {
            lists.list1 = self.entries.range(split + 1..).collect();
        }

        Ok(lists)
    }

    fn hierarchical_lists(&self, picture: &PictureInfo) -> ReferenceResult<RefLists<'_, R>> {
        let missing = || ReferenceError::MissingReference(picture.type_, picture.poc);
        let mut lists = RefLists::empty();

        // Closest past picture of a lower layer, or of the base layer for base layer pictures.
        let ref0 = self
            .entries
            .iter()
            .filter(|entry| {
                poc_greater_than(picture.poc, entry.poc, self.max_pic_order_cnt)
                    && if picture.temporal_id > 0 {
                        entry.temporal_id < picture.temporal_id
                    } else {
                        entry.temporal_id == 0
                    }
            })
            .max_by_key(|entry| entry.poc)
            .ok_or_else(missing)?;

        lists.abs_diff_pic_num_l0 = self.pic_num_diff(picture, ref0);
        lists.list0.push(ref0);

        if !picture.type_.is_b() {
            return Ok(lists);
        }

        // Closest future picture of a lower layer.
        let ref1 = self
            .entries
            .iter()
            .filter(|entry| {
                poc_greater_than(entry.poc, picture.poc, self.max_pic_order_cnt)
                    && entry.temporal_id < picture.temporal_id
            })
            .min_by_key(|entry| entry.poc)
            .ok_or_else(missing)?;

        lists.abs_diff_pic_num_l1 = self.pic_num_diff(picture, ref1);
        lists.list1.push(ref1);

        Ok(lists)
    }
}
