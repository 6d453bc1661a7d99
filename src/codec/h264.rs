// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod codec_data;
pub mod levels;
pub mod nalu_writer;
pub mod synthesizer;
pub mod syntax;
