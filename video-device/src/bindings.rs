// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kernel ABI for the V4L2 and DRM ioctls used by this crate.
//!
//! Layouts mirror `linux/videodev2.h`, `drm/drm.h` and `drm/i915_drm.h` for
//! 64-bit Linux. Only the structures and requests we actually issue are
//! declared.

#![allow(non_camel_case_types, dead_code)]

use std::os::raw::{c_char, c_int, c_ulong, c_void};

use vmm_sys_util::{ioctl_ioc_nr, ioctl_ior_nr, ioctl_iow_nr, ioctl_iowr_nr};

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;

pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_DMABUF: u32 = 4;

pub const V4L2_FIELD_ANY: u32 = 0;
pub const V4L2_FIELD_NONE: u32 = 1;
pub const V4L2_FIELD_INTERLACED: u32 = 4;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct v4l2_pix_format {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

/// `fmt` union of `struct v4l2_format`. The kernel union holds pointers in
/// `struct v4l2_window`, hence the 8-byte alignment.
#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_format_fmt {
    pub pix: v4l2_pix_format,
    _raw_data: [u64; 25],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_fmt,
}

impl Default for v4l2_format {
    fn default() -> Self {
        // SAFETY: plain-old-data kernel structure, all-zero is a valid value.
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut c_void,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl Default for v4l2_buffer {
    fn default() -> Self {
        // SAFETY: plain-old-data kernel structure, all-zero is a valid value.
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct v4l2_exportbuffer {
    pub type_: u32,
    pub index: u32,
    pub plane: u32,
    pub flags: u32,
    pub fd: i32,
    pub reserved: [u32; 11],
}

const VIDEO_IOCTL_BASE: u32 = b'V' as u32;

ioctl_ior_nr!(VIDIOC_QUERYCAP, VIDEO_IOCTL_BASE, 0, v4l2_capability);
ioctl_iowr_nr!(VIDIOC_S_FMT, VIDEO_IOCTL_BASE, 5, v4l2_format);
ioctl_iowr_nr!(VIDIOC_REQBUFS, VIDEO_IOCTL_BASE, 8, v4l2_requestbuffers);
ioctl_iowr_nr!(VIDIOC_QUERYBUF, VIDEO_IOCTL_BASE, 9, v4l2_buffer);
ioctl_iowr_nr!(VIDIOC_QBUF, VIDEO_IOCTL_BASE, 15, v4l2_buffer);
ioctl_iowr_nr!(VIDIOC_EXPBUF, VIDEO_IOCTL_BASE, 16, v4l2_exportbuffer);
ioctl_iowr_nr!(VIDIOC_DQBUF, VIDEO_IOCTL_BASE, 17, v4l2_buffer);
ioctl_iow_nr!(VIDIOC_STREAMON, VIDEO_IOCTL_BASE, 18, c_int);
ioctl_iow_nr!(VIDIOC_STREAMOFF, VIDEO_IOCTL_BASE, 19, c_int);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct drm_version {
    pub version_major: c_int,
    pub version_minor: c_int,
    pub version_patchlevel: c_int,
    pub name_len: usize,
    pub name: *mut c_char,
    pub date_len: usize,
    pub date: *mut c_char,
    pub desc_len: usize,
    pub desc: *mut c_char,
}

impl Default for drm_version {
    fn default() -> Self {
        // SAFETY: null pointers with zero lengths ask the kernel for sizes only.
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_gem_close {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_prime_handle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_i915_gem_create {
    pub size: u64,
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_i915_gem_set_tiling {
    pub handle: u32,
    pub tiling_mode: u32,
    pub stride: u32,
    pub swizzle_mode: u32,
}

pub const I915_TILING_NONE: u32 = 0;

const DRM_IOCTL_BASE: u32 = b'd' as u32;
const DRM_COMMAND_BASE: u32 = 0x40;

ioctl_iowr_nr!(DRM_IOCTL_VERSION, DRM_IOCTL_BASE, 0x00, drm_version);
ioctl_iow_nr!(DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_BASE, 0x09, drm_gem_close);
ioctl_iowr_nr!(DRM_IOCTL_PRIME_HANDLE_TO_FD, DRM_IOCTL_BASE, 0x2d, drm_prime_handle);
ioctl_iowr_nr!(
    DRM_IOCTL_I915_GEM_CREATE,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + 0x1b,
    drm_i915_gem_create
);
ioctl_iowr_nr!(
    DRM_IOCTL_I915_GEM_SET_TILING,
    DRM_IOCTL_BASE,
    DRM_COMMAND_BASE + 0x21,
    drm_i915_gem_set_tiling
);

/// Decode a fixed-size, NUL-padded kernel string.
pub fn c_str_field(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes_match_kernel_abi() {
        assert_eq!(std::mem::size_of::<v4l2_capability>(), 104);
        assert_eq!(std::mem::size_of::<v4l2_pix_format>(), 48);
        assert_eq!(std::mem::size_of::<v4l2_format>(), 208);
        assert_eq!(std::mem::size_of::<v4l2_requestbuffers>(), 20);
        assert_eq!(std::mem::size_of::<v4l2_buffer>(), 88);
        assert_eq!(std::mem::size_of::<v4l2_exportbuffer>(), 64);
        assert_eq!(std::mem::size_of::<drm_version>(), 64);
        assert_eq!(std::mem::size_of::<drm_prime_handle>(), 12);
        assert_eq!(std::mem::size_of::<drm_i915_gem_create>(), 16);
    }

    #[test]
    fn test_ioctl_request_numbers() {
        assert_eq!(VIDIOC_QUERYCAP(), 0x8068_5600);
        assert_eq!(VIDIOC_S_FMT(), 0xc0d0_5605);
        assert_eq!(VIDIOC_REQBUFS(), 0xc014_5608);
        assert_eq!(VIDIOC_QBUF(), 0xc058_560f);
        assert_eq!(VIDIOC_DQBUF(), 0xc058_5611);
        assert_eq!(VIDIOC_STREAMON(), 0x4004_5612);
        assert_eq!(DRM_IOCTL_PRIME_HANDLE_TO_FD(), 0xc00c_642d);
    }

    #[test]
    fn test_c_str_field() {
        let mut card = [0u8; 32];
        card[..8].copy_from_slice(b"Dummy vi");
        assert_eq!(c_str_field(&card), "Dummy vi");
        assert_eq!(c_str_field(b"full"), "full");
    }
}
