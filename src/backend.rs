// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared code for codec backends.
//!
//! A backend is a provider of encoding, most likely hardware-accelerated. The encoder only talks
//! to it through [`crate::encoder::stateless::h264::StatelessH264EncoderBackend`].

pub mod dummy;
