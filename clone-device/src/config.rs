// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Command line configuration.

use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use video_device::{DEFAULT_RENDER_NODE, FourCc, PixFormat};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required option had no value after parsing.
    #[error("Missing value for --{0}")]
    Missing(&'static str),

    /// The configuration is internally inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Clone device configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneConfig {
    /// Capture device node.
    pub input: PathBuf,
    /// Output device node.
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCc,
    /// Back the output queue with DMA-BUFs from the render node.
    pub dmabuf: bool,
    /// Render node used when `dmabuf` is set.
    pub drm_device: PathBuf,
    /// Map capture buffers through `VIDIOC_EXPBUF` on every dequeue.
    pub export_capture: bool,
    /// Buffers requested per device.
    pub buffers: u32,
    /// Log progress every this many frames. Zero disables it.
    pub report_interval: u64,
    pub verbose: bool,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("/dev/video0"),
            output: PathBuf::from("/dev/video2"),
            width: 640,
            height: 360,
            fourcc: FourCc::YUYV,
            dmabuf: false,
            drm_device: PathBuf::from(DEFAULT_RENDER_NODE),
            export_capture: false,
            buffers: 10,
            report_interval: 100,
            verbose: false,
        }
    }
}

impl CloneConfig {
    /// Command line definition.
    pub fn command() -> Command {
        Command::new("v4l2-clone-device")
            .version(env!("CARGO_PKG_VERSION"))
            .author("The Cloud Hypervisor Authors")
            .about("Relay frames from a V4L2 capture device into a V4L2 output device")
            .arg(
                Arg::new("input")
                    .short('i')
                    .long("input")
                    .value_name("PATH")
                    .default_value("/dev/video0")
                    .value_parser(value_parser!(PathBuf))
                    .help("Capture device"),
            )
            .arg(
                Arg::new("output")
                    .short('o')
                    .long("output")
                    .value_name("PATH")
                    .default_value("/dev/video2")
                    .value_parser(value_parser!(PathBuf))
                    .help("Output device"),
            )
            .arg(
                Arg::new("width")
                    .long("width")
                    .value_name("PIXELS")
                    .default_value("640")
                    .value_parser(value_parser!(u32).range(1..))
                    .help("Capture video width"),
            )
            .arg(
                Arg::new("height")
                    .long("height")
                    .value_name("PIXELS")
                    .default_value("360")
                    .value_parser(value_parser!(u32).range(1..))
                    .help("Capture video height"),
            )
            .arg(
                Arg::new("fourcc")
                    .long("fourcc")
                    .value_name("CODE")
                    .default_value("YUYV")
                    .value_parser(|s: &str| s.parse::<FourCc>())
                    .help("Pixel format requested from both devices"),
            )
            .arg(
                Arg::new("dmabuf")
                    .long("dmabuf")
                    .action(ArgAction::SetTrue)
                    .help("Use DMABUF for output device enqueuing"),
            )
            .arg(
                Arg::new("drm-device")
                    .long("drm-device")
                    .value_name("PATH")
                    .default_value(DEFAULT_RENDER_NODE)
                    .value_parser(value_parser!(PathBuf))
                    .help("Render node allocating DMABUF output buffers"),
            )
            .arg(
                Arg::new("export-capture")
                    .long("export-capture")
                    .action(ArgAction::SetTrue)
                    .help("Map capture buffers through VIDIOC_EXPBUF"),
            )
            .arg(
                Arg::new("buffers")
                    .long("buffers")
                    .value_name("N")
                    .default_value("10")
                    .value_parser(value_parser!(u32).range(1..=32))
                    .help("Buffers requested per device"),
            )
            .arg(
                Arg::new("report-interval")
                    .long("report-interval")
                    .value_name("FRAMES")
                    .default_value("100")
                    .value_parser(value_parser!(u64))
                    .help("Log progress every N frames, 0 to disable"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .action(ArgAction::SetTrue)
                    .help("Enable verbose logging"),
            )
    }

    /// Build the configuration from parsed arguments.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, ConfigError> {
        fn required<T: Clone + Send + Sync + 'static>(
            matches: &ArgMatches,
            name: &'static str,
        ) -> Result<T, ConfigError> {
            matches
                .get_one::<T>(name)
                .cloned()
                .ok_or(ConfigError::Missing(name))
        }

        let config = Self {
            input: required(matches, "input")?,
            output: required(matches, "output")?,
            width: required(matches, "width")?,
            height: required(matches, "height")?,
            fourcc: required(matches, "fourcc")?,
            dmabuf: matches.get_flag("dmabuf"),
            drm_device: required(matches, "drm-device")?,
            export_capture: matches.get_flag("export-capture"),
            buffers: required(matches, "buffers")?,
            report_interval: required(matches, "report-interval")?,
            verbose: matches.get_flag("verbose"),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.input == self.output {
            return Err(ConfigError::Invalid(format!(
                "capture and output both use {}",
                self.input.display()
            )));
        }
        Ok(())
    }

    /// Format requested from the capture device.
    pub fn requested_format(&self) -> PixFormat {
        PixFormat::new(self.fourcc, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CloneConfig, ConfigError> {
        let mut argv = vec!["v4l2-clone-device"];
        argv.extend_from_slice(args);
        let matches = CloneConfig::command()
            .try_get_matches_from(argv)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        CloneConfig::from_matches(&matches)
    }

    #[test]
    fn test_defaults_match_default_impl() {
        assert_eq!(parse(&[]).unwrap(), CloneConfig::default());
    }

    #[test]
    fn test_all_options() {
        let config = parse(&[
            "-i",
            "/dev/video4",
            "-o",
            "/dev/video5",
            "--width",
            "1280",
            "--height",
            "720",
            "--fourcc",
            "NV12",
            "--dmabuf",
            "--drm-device",
            "/dev/dri/renderD129",
            "--export-capture",
            "--buffers",
            "4",
            "--report-interval",
            "0",
            "-v",
        ])
        .unwrap();

        assert_eq!(config.input, PathBuf::from("/dev/video4"));
        assert_eq!(config.output, PathBuf::from("/dev/video5"));
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.fourcc, FourCc::NV12);
        assert!(config.dmabuf);
        assert_eq!(config.drm_device, PathBuf::from("/dev/dri/renderD129"));
        assert!(config.export_capture);
        assert_eq!(config.buffers, 4);
        assert_eq!(config.report_interval, 0);
        assert!(config.verbose);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(parse(&["--width", "0"]), Err(ConfigError::Invalid(_))));
        assert!(matches!(parse(&["--buffers", "64"]), Err(ConfigError::Invalid(_))));
        assert!(matches!(parse(&["--fourcc", "YU"]), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_same_node() {
        let err = parse(&["-i", "/dev/video1", "-o", "/dev/video1"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: capture and output both use /dev/video1"
        );
    }

    #[test]
    fn test_requested_format() {
        let format = CloneConfig::default().requested_format();
        assert_eq!(format, PixFormat::new(FourCc::YUYV, 640, 360));
    }
}
