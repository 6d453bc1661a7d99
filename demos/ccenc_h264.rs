// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs the H.264 encoder session on the dummy backend and writes the headers stream it
//! produces, with fake slice payloads, and the decoder configuration record.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use argh::FromArgs;
use cros_h264enc::backend::dummy::Backend;
use cros_h264enc::backend::dummy::Capabilities;
use cros_h264enc::codec::h264::syntax::Level;
use cros_h264enc::encoder::h264::EncoderConfig;
use cros_h264enc::encoder::h264::EntryPoint;
use cros_h264enc::encoder::stateless::h264::StatelessEncoder;
use cros_h264enc::encoder::stateless::StatelessVideoEncoder;
use cros_h264enc::encoder::FrameMetadata;
use cros_h264enc::encoder::RateControl;
use cros_h264enc::BlockingMode;
use cros_h264enc::Fraction;
use cros_h264enc::Resolution;

/// Simple encoder
#[derive(Debug, FromArgs)]
struct Args {
    /// input frames width
    #[argh(option, default = "320")]
    width: u32,

    /// input frames height
    #[argh(option, default = "240")]
    height: u32,

    /// input frames count
    #[argh(option, default = "30")]
    count: u64,

    /// framerate
    #[argh(option, default = "30")]
    framerate: u32,

    /// constant bitrate in kbit/s, constant QP when unset
    #[argh(option)]
    bitrate: Option<u32>,

    /// quantization parameter of the constant QP mode
    #[argh(option, default = "26")]
    qp: u32,

    /// number of B-frames between anchors
    #[argh(option, default = "0")]
    bframes: u32,

    /// number of slices per picture
    #[argh(option, default = "1")]
    slices: u32,

    /// distance between two I pictures
    #[argh(option, default = "30")]
    keyframe_period: u32,

    /// number of temporal layers
    #[argh(option, default = "1")]
    temporal_levels: u32,

    /// lowest level_idc to signal, eg. 31 for level 3.1
    #[argh(option)]
    level: Option<u8>,

    /// number of MVC views
    #[argh(option, default = "1")]
    views: u32,

    /// enable CABAC
    #[argh(switch)]
    cabac: bool,

    /// enable the 8x8 transform
    #[argh(switch)]
    dct8x8: bool,

    /// write access unit delimiters
    #[argh(switch)]
    aud: bool,

    /// set to true if low power version of the API shall be used
    #[argh(switch)]
    low_power: bool,

    /// output file to write the coded stream to
    #[argh(option)]
    output: Option<PathBuf>,

    /// output file to write the decoder configuration record to
    #[argh(option)]
    codec_data: Option<PathBuf>,
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let resolution = Resolution {
        width: args.width,
        height: args.height,
    };

    let level = args
        .level
        .map(|idc| Level::n(idc).unwrap_or_else(|| panic!("unknown level_idc {idc}")));

    let config = EncoderConfig {
        resolution,
        framerate: Fraction::new(args.framerate, 1),
        rate_control: match args.bitrate {
            Some(kbps) => RateControl::ConstantBitrate(Some(kbps)),
            None => RateControl::ConstantQuality(args.qp),
        },
        num_bframes: args.bframes,
        num_slices: args.slices,
        keyframe_period: args.keyframe_period,
        temporal_levels: args.temporal_levels,
        num_views: args.views,
        level,
        use_cabac: args.cabac,
        use_dct8x8: args.dct8x8,
        use_aud: args.aud,
        entry_point: if args.low_power {
            EntryPoint::EncodeLowPower
        } else {
            EntryPoint::Encode
        },
        ..Default::default()
    };

    let backend = Backend::new(Capabilities::default());
    let mut encoder = StatelessEncoder::<u64, _>::new(backend, config, BlockingMode::Blocking)
        .expect("Unable to create encoder");

    let seq = encoder.sequence();
    log::info!(
        "profile {} level {:?} bitrate {} kbps",
        seq.profile,
        seq.level.level,
        seq.bitrate_kbps
    );

    if let Some(path) = args.codec_data {
        let record = encoder.codec_data().expect("failed to build codec data");
        File::create(path)
            .and_then(|mut file| file.write_all(&record))
            .expect("failed to write codec data");
    }

    let mut output = args
        .output
        .map(|output| File::create(output).expect("error creating output file"));

    for i in 0..args.count {
        let meta = FrameMetadata {
            timestamp: i,
            display_resolution: resolution,
            force_keyframe: false,
        };

        encoder.encode(meta, i).unwrap();
        while let Some(coded) = encoder.poll().unwrap() {
            if let Some(ref mut output) = output {
                output.write_all(&coded.bitstream).unwrap();
            }
        }
    }

    encoder.drain().unwrap();
    while let Some(coded) = encoder.poll().unwrap() {
        if let Some(ref mut output) = output {
            output.write_all(&coded.bitstream).unwrap();
        }
    }

    log::info!("{} pictures submitted", encoder.backend().submitted.len());
}
