// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pixel format negotiation
//!
//! A format is only trusted once the driver has confirmed it: we send the
//! desired encoding and geometry with `VIDIOC_S_FMT` and compare the answer
//! with the request. Capture drivers are free to pick stride and image size;
//! output drivers must take ours verbatim because the capture side dictates
//! the layout of every frame we copy in.

use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};

use crate::bindings::{
    V4L2_FIELD_ANY, V4L2_FIELD_INTERLACED, V4L2_FIELD_NONE, v4l2_pix_format,
};
use crate::driver::{Direction, VideoDriver};
use crate::{Error, Result};

/// A V4L2 four-character code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(u32);

impl FourCc {
    /// Packed YUV 4:2:2, the layout v4l2loopback and most webcams agree on.
    pub const YUYV: FourCc = FourCc::new(b"YUYV");
    pub const MJPG: FourCc = FourCc::new(b"MJPG");
    pub const NV12: FourCc = FourCc::new(b"NV12");

    pub const fn new(code: &[u8; 4]) -> Self {
        FourCc(u32::from_le_bytes(*code))
    }

    pub const fn from_raw(raw: u32) -> Self {
        FourCc(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub fn bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.bytes() {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let code: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| format!("FourCC must be exactly 4 bytes, got {s:?}"))?;
        Ok(FourCc::new(&code))
    }
}

/// Field order of a video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Field {
    /// Let the driver choose.
    #[default]
    Any,
    /// Progressive.
    None,
    /// Both fields interleaved in one buffer.
    Interlaced,
    /// Any other `enum v4l2_field` value.
    Other(u32),
}

impl Field {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            V4L2_FIELD_ANY => Field::Any,
            V4L2_FIELD_NONE => Field::None,
            V4L2_FIELD_INTERLACED => Field::Interlaced,
            other => Field::Other(other),
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Field::Any => V4L2_FIELD_ANY,
            Field::None => V4L2_FIELD_NONE,
            Field::Interlaced => V4L2_FIELD_INTERLACED,
            Field::Other(raw) => raw,
        }
    }
}

/// Single-planar pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixFormat {
    pub fourcc: FourCc,
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes. Zero in a request lets the driver choose.
    pub bytes_per_line: u32,
    /// Total frame size in bytes. Zero in a request lets the driver choose.
    pub size_image: u32,
    pub field: Field,
}

impl PixFormat {
    /// Request `fourcc` at `width`x`height`, leaving the layout to the driver.
    pub fn new(fourcc: FourCc, width: u32, height: u32) -> Self {
        Self {
            fourcc,
            width,
            height,
            bytes_per_line: 0,
            size_image: 0,
            field: Field::Any,
        }
    }

    pub(crate) fn to_raw(self) -> v4l2_pix_format {
        v4l2_pix_format {
            width: self.width,
            height: self.height,
            pixelformat: self.fourcc.as_raw(),
            field: self.field.as_raw(),
            bytesperline: self.bytes_per_line,
            sizeimage: self.size_image,
            ..Default::default()
        }
    }

    pub(crate) fn from_raw(raw: &v4l2_pix_format) -> Self {
        Self {
            fourcc: FourCc::from_raw(raw.pixelformat),
            width: raw.width,
            height: raw.height,
            bytes_per_line: raw.bytesperline,
            size_image: raw.sizeimage,
            field: Field::from_raw(raw.field),
        }
    }

    /// First difference between `self` (expected) and `actual`.
    ///
    /// Encoding and dimensions are always compared. Stride and image size
    /// only when `check_layout` is set.
    pub fn mismatch(&self, actual: &PixFormat, check_layout: bool) -> Option<FormatMismatch> {
        if self.fourcc != actual.fourcc {
            return Some(FormatMismatch::PixelFormat {
                requested: self.fourcc,
                accepted: actual.fourcc,
            });
        }
        if self.width != actual.width || self.height != actual.height {
            return Some(FormatMismatch::Size {
                requested: (self.width, self.height),
                accepted: (actual.width, actual.height),
            });
        }
        if !check_layout {
            return None;
        }
        if self.bytes_per_line != actual.bytes_per_line {
            return Some(FormatMismatch::BytesPerLine {
                requested: self.bytes_per_line,
                accepted: actual.bytes_per_line,
            });
        }
        if self.size_image != actual.size_image {
            return Some(FormatMismatch::SizeImage {
                requested: self.size_image,
                accepted: actual.size_image,
            });
        }
        None
    }

    /// Whether frames laid out as `self` can be copied verbatim into
    /// buffers laid out as `other`.
    pub fn matches(&self, other: &PixFormat) -> bool {
        self.mismatch(other, true).is_none()
    }
}

impl fmt::Display for PixFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}x{}, bytesperline {}, sizeimage {}",
            self.fourcc, self.width, self.height, self.bytes_per_line, self.size_image
        )
    }
}

/// Why a driver's answer to a format request was not acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatMismatch {
    PixelFormat { requested: FourCc, accepted: FourCc },
    Size { requested: (u32, u32), accepted: (u32, u32) },
    BytesPerLine { requested: u32, accepted: u32 },
    SizeImage { requested: u32, accepted: u32 },
}

impl fmt::Display for FormatMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatMismatch::PixelFormat {
                requested,
                accepted,
            } => write!(f, "pixelformat not supported {requested}, expected {accepted}"),
            FormatMismatch::Size {
                requested,
                accepted,
            } => write!(
                f,
                "video size not supported {}x{}, expected {}x{}",
                requested.0, requested.1, accepted.0, accepted.1
            ),
            FormatMismatch::BytesPerLine {
                requested,
                accepted,
            } => write!(f, "bytesperline not supported {requested}, expected {accepted}"),
            FormatMismatch::SizeImage {
                requested,
                accepted,
            } => write!(f, "sizeimage not supported {requested}, expected {accepted}"),
        }
    }
}

/// Outcome of [`negotiate_format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// The driver confirmed this format.
    Accepted(PixFormat),
    /// The driver answered with something we cannot use.
    Rejected(FormatMismatch),
}

impl Negotiation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Negotiation::Accepted(_))
    }

    pub fn accepted(self) -> Option<PixFormat> {
        match self {
            Negotiation::Accepted(format) => Some(format),
            Negotiation::Rejected(_) => None,
        }
    }
}

/// Set `requested` on `driver` and validate the driver's answer.
///
/// A failing `VIDIOC_S_FMT` or an interlaced answer is an error. Any other
/// difference is reported as [`Negotiation::Rejected`] so the caller can
/// decide how to end the session.
pub fn negotiate_format<D: VideoDriver + ?Sized>(
    driver: &D,
    direction: Direction,
    requested: &PixFormat,
) -> Result<Negotiation> {
    match driver.query_capability() {
        Ok(cap) => debug!("Negotiating {direction:?} format on {}", cap.card),
        Err(e) => warn!("ioctl(VIDIOC_QUERYCAP) failed: {e}"),
    }

    let accepted = driver
        .set_format(direction, requested)
        .map_err(Error::SetFormat)?;

    let check_layout = direction == Direction::Output;
    if let Some(mismatch) = requested.mismatch(&accepted, check_layout) {
        warn!("{mismatch}");
        return Ok(Negotiation::Rejected(mismatch));
    }

    if accepted.field == Field::Interlaced {
        return Err(Error::InterlacedUnsupported);
    }

    info!("Set device pix format: {accepted}");
    Ok(Negotiation::Accepted(accepted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDriver;

    #[test]
    fn test_fourcc_roundtrip_and_display() {
        assert_eq!(FourCc::YUYV.as_raw(), 0x5659_5559);
        assert_eq!(FourCc::YUYV.to_string(), "YUYV");
        assert_eq!("MJPG".parse::<FourCc>().unwrap(), FourCc::MJPG);
        assert_eq!(
            "YUV".parse::<FourCc>().unwrap_err(),
            "FourCC must be exactly 4 bytes, got \"YUV\""
        );
        assert_eq!(FourCc::from_raw(0x0000_0041).to_string(), "A...");
    }

    #[test]
    fn test_field_raw_values() {
        assert_eq!(Field::from_raw(1), Field::None);
        assert_eq!(Field::from_raw(4), Field::Interlaced);
        assert_eq!(Field::from_raw(7), Field::Other(7));
        assert_eq!(Field::Other(7).as_raw(), 7);
    }

    #[test]
    fn test_mismatch_order() {
        let requested = PixFormat::new(FourCc::YUYV, 640, 360);
        let mut accepted = requested;
        accepted.fourcc = FourCc::MJPG;
        accepted.width = 1280;
        assert!(matches!(
            requested.mismatch(&accepted, false),
            Some(FormatMismatch::PixelFormat { .. })
        ));

        accepted.fourcc = FourCc::YUYV;
        assert_eq!(
            requested.mismatch(&accepted, false),
            Some(FormatMismatch::Size {
                requested: (640, 360),
                accepted: (1280, 360),
            })
        );
    }

    #[test]
    fn test_layout_checked_only_on_request() {
        let requested = PixFormat::new(FourCc::YUYV, 640, 360);
        let mut accepted = requested;
        accepted.bytes_per_line = 1280;
        accepted.size_image = 460_800;
        assert_eq!(requested.mismatch(&accepted, false), None);
        assert_eq!(
            requested.mismatch(&accepted, true),
            Some(FormatMismatch::BytesPerLine {
                requested: 0,
                accepted: 1280,
            })
        );
        assert!(!requested.matches(&accepted));
        assert!(accepted.matches(&accepted));
    }

    #[test]
    fn test_stride_accepted_for_capture_rejected_for_output() {
        let driver = FakeDriver::builder().stride_padding(64).build();
        let requested = PixFormat {
            bytes_per_line: 1280,
            size_image: 1280 * 360,
            ..PixFormat::new(FourCc::YUYV, 640, 360)
        };

        let capture = negotiate_format(&driver, Direction::Capture, &requested).unwrap();
        let accepted = capture.accepted().unwrap();
        assert_eq!(accepted.bytes_per_line, 1344);

        let output = negotiate_format(&driver, Direction::Output, &requested).unwrap();
        assert!(!output.is_accepted());
        assert_eq!(
            output,
            Negotiation::Rejected(FormatMismatch::BytesPerLine {
                requested: 1280,
                accepted: 1344,
            })
        );
    }

    #[test]
    fn test_output_accepts_capture_confirmed_format() {
        let capture = FakeDriver::builder().build();
        let output = FakeDriver::builder().build();

        let confirmed = negotiate_format(
            &capture,
            Direction::Capture,
            &PixFormat::new(FourCc::YUYV, 640, 360),
        )
        .unwrap()
        .accepted()
        .unwrap();
        assert_eq!(confirmed.bytes_per_line, 1280);
        assert_eq!(confirmed.size_image, 460_800);

        let echoed = negotiate_format(&output, Direction::Output, &confirmed).unwrap();
        assert_eq!(echoed, Negotiation::Accepted(confirmed));
    }

    #[test]
    fn test_encoding_and_size_mismatch_are_soft() {
        let driver = FakeDriver::builder()
            .accepted_fourcc(FourCc::MJPG)
            .build();
        let outcome = negotiate_format(
            &driver,
            Direction::Capture,
            &PixFormat::new(FourCc::YUYV, 640, 360),
        )
        .unwrap();
        assert!(matches!(
            outcome,
            Negotiation::Rejected(FormatMismatch::PixelFormat { .. })
        ));

        let driver = FakeDriver::builder().max_size(320, 240).build();
        let outcome = negotiate_format(
            &driver,
            Direction::Capture,
            &PixFormat::new(FourCc::YUYV, 640, 360),
        )
        .unwrap();
        assert!(matches!(
            outcome,
            Negotiation::Rejected(FormatMismatch::Size { .. })
        ));
    }

    #[test]
    fn test_interlaced_is_fatal() {
        let driver = FakeDriver::builder().field(Field::Interlaced).build();
        let err = negotiate_format(
            &driver,
            Direction::Capture,
            &PixFormat::new(FourCc::YUYV, 640, 360),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InterlacedUnsupported));
    }

    #[test]
    fn test_set_format_failure_is_fatal() {
        let driver = FakeDriver::builder().reject_set_format().build();
        let err = negotiate_format(
            &driver,
            Direction::Output,
            &PixFormat::new(FourCc::YUYV, 640, 360),
        )
        .unwrap_err();
        assert!(matches!(err, Error::SetFormat(_)));
    }
}
