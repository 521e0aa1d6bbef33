// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! v4l2-clone-device CLI entry point.

use std::process::ExitCode;

use anyhow::Context;
use log::{LevelFilter, error, info};
use simple_logger::SimpleLogger;

use v4l2_clone_device::{
    CloneConfig, OutputKind, Session, SessionSetup, ShutdownToken, install_interrupt_handler,
};
use video_device::{I915Allocator, V4l2Driver};

fn main() -> anyhow::Result<ExitCode> {
    let matches = CloneConfig::command().get_matches();
    let config = CloneConfig::from_matches(&matches)?;

    let log_level = if config.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .context("Failed to initialize logging")?;

    info!("Starting v4l2-clone-device with config: {config:?}");

    let token = ShutdownToken::new();
    install_interrupt_handler(&token).context("Failed to install Ctrl+C handler")?;

    let capture = V4l2Driver::open(&config.input).context("Invalid capture device")?;
    let output = V4l2Driver::open(&config.output).context("Invalid output device")?;
    let output_kind = if config.dmabuf {
        let allocator =
            I915Allocator::open(&config.drm_device).context("Invalid DRM render node")?;
        OutputKind::Dmabuf(Box::new(allocator))
    } else {
        OutputKind::Mmap
    };

    let mut session = match Session::setup(capture, output, output_kind, &config)
        .context("Failed to set up devices")?
    {
        SessionSetup::Ready(session) => session,
        SessionSetup::FormatRejected {
            direction,
            mismatch,
        } => {
            error!("{direction:?} device rejected the format: {mismatch}");
            return Ok(ExitCode::FAILURE);
        }
    };
    info!(
        "Streaming {} with {} capture and {} output buffers, press Ctrl+C to stop",
        session.format(),
        session.capture_buffers(),
        session.output_buffers()
    );

    let relayed = session.run(&token, None);
    let stopped = session.shutdown();
    let stats = relayed.context("Frame transport failed")?;
    stopped.context("Failed to stop streaming")?;

    info!("Relayed {} frames ({:?})", stats.frames, stats.stop_reason);
    Ok(ExitCode::SUCCESS)
}
