// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shareable buffer memory
//!
//! ```text
//!   BufferAllocator::allocate(size)
//!          │
//!          ▼
//!   ┌─────────────┐  map()    ┌─────────┐
//!   │   DmaBuf    │ ────────▶ │ MmapMut │  (CPU access, at most one live)
//!   │  fd + size  │ ◀──────── │         │
//!   └─────────────┘  unmap()  └─────────┘
//!          │
//!          └── fd queued to the video driver (V4L2_MEMORY_DMABUF)
//! ```
//!
//! The graphics-side handle is closed as soon as the PRIME descriptor
//! exists; the descriptor alone keeps the memory alive.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use log::{debug, info, warn};
use memmap2::{MmapMut, MmapOptions};
use vmm_sys_util::ioctl::ioctl_with_mut_ref;

use crate::bindings::*;
use crate::{Error, Result};

/// Render node used when none is configured.
pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

/// Source of shareable buffers for DMABUF output devices.
pub trait BufferAllocator: Send {
    /// Allocate a buffer of at least `size` bytes.
    fn allocate(&self, size: usize) -> Result<DmaBuf>;
}

impl<A: BufferAllocator + ?Sized> BufferAllocator for Box<A> {
    fn allocate(&self, size: usize) -> Result<DmaBuf> {
        (**self).allocate(size)
    }
}

/// A DMA-BUF descriptor plus the size of the memory behind it.
#[derive(Debug)]
pub struct DmaBuf {
    fd: OwnedFd,
    size: usize,
    mapped_addr: Option<usize>,
}

impl DmaBuf {
    pub fn from_fd(fd: OwnedFd, size: usize) -> Self {
        Self {
            fd,
            size,
            mapped_addr: None,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped_addr.is_some()
    }

    /// Map the whole buffer read-write.
    ///
    /// # Panics
    ///
    /// If a mapping obtained from this handle is still live.
    pub fn map(&mut self) -> io::Result<MmapMut> {
        assert!(
            self.mapped_addr.is_none(),
            "DMA-BUF fd {} mapped twice",
            self.fd.as_raw_fd()
        );
        // SAFETY: the descriptor refers to a DMA-BUF of `size` bytes that
        // lives as long as `self`. The device only reads it while the buffer
        // is queued, and the mapping is released before queueing.
        let mapping = unsafe { MmapOptions::new().len(self.size).map_mut(&self.fd)? };
        self.mapped_addr = Some(mapping.as_ptr() as usize);
        Ok(mapping)
    }

    /// Release a mapping obtained from [`map`](Self::map).
    ///
    /// # Panics
    ///
    /// If `mapping` is not the live mapping of this handle. Unmapping
    /// anything else would leave stale CPU access to device memory.
    pub fn unmap(&mut self, mapping: MmapMut) {
        let addr = mapping.as_ptr() as usize;
        match self.mapped_addr {
            Some(mapped) if mapped == addr => {}
            other => panic!(
                "DMA-BUF fd {}: unmapping {addr:#x}, mapped at {other:x?}",
                self.fd.as_raw_fd()
            ),
        }
        drop(mapping);
        self.mapped_addr = None;
    }
}

impl AsRawFd for DmaBuf {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for DmaBuf {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Allocates untiled GEM objects on an Intel render node and exports them
/// as DMA-BUFs.
#[derive(Debug)]
pub struct I915Allocator {
    drm: File,
}

impl I915Allocator {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let drm = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::Open {
                path: path.to_path_buf(),
                source,
            })?;
        let allocator = Self { drm };
        match allocator.version() {
            Ok((name, desc)) => info!("DRM driver {name} ({desc}) on {}", path.display()),
            Err(e) => warn!("DRM_IOCTL_VERSION failed on {}: {e}", path.display()),
        }
        Ok(allocator)
    }

    /// Issue `request`, restarting on `EINTR` and `EAGAIN` like libdrm.
    fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
        loop {
            // SAFETY: `arg` is the structure `request` was declared with and
            // the render node stays open for the call.
            let ret = unsafe { ioctl_with_mut_ref(&self.drm, request, arg) };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Driver name and description.
    fn version(&self) -> io::Result<(String, String)> {
        let mut version = drm_version::default();
        self.ioctl(DRM_IOCTL_VERSION(), &mut version)?;

        let mut name = vec![0u8; version.name_len];
        let mut date = vec![0u8; version.date_len];
        let mut desc = vec![0u8; version.desc_len];
        version.name = name.as_mut_ptr().cast();
        version.date = date.as_mut_ptr().cast();
        version.desc = desc.as_mut_ptr().cast();
        self.ioctl(DRM_IOCTL_VERSION(), &mut version)?;

        Ok((c_str_field(&name), c_str_field(&desc)))
    }

    fn close_handle(&self, handle: u32) {
        let mut close = drm_gem_close { handle, pad: 0 };
        if let Err(e) = self.ioctl(DRM_IOCTL_GEM_CLOSE(), &mut close) {
            warn!("DRM_IOCTL_GEM_CLOSE failed for handle {handle}: {e}");
        }
    }
}

impl BufferAllocator for I915Allocator {
    fn allocate(&self, size: usize) -> Result<DmaBuf> {
        if size == 0 {
            return Err(Error::InvalidAllocation(size));
        }

        let mut create = drm_i915_gem_create {
            size: size as u64,
            ..Default::default()
        };
        self.ioctl(DRM_IOCTL_I915_GEM_CREATE(), &mut create)
            .map_err(|source| Error::Drm {
                op: "DRM_IOCTL_I915_GEM_CREATE",
                source,
            })?;
        let handle = create.handle;

        let mut tiling = drm_i915_gem_set_tiling {
            handle,
            tiling_mode: I915_TILING_NONE,
            ..Default::default()
        };
        if let Err(source) = self.ioctl(DRM_IOCTL_I915_GEM_SET_TILING(), &mut tiling) {
            self.close_handle(handle);
            return Err(Error::Drm {
                op: "DRM_IOCTL_I915_GEM_SET_TILING",
                source,
            });
        }

        let mut prime = drm_prime_handle {
            handle,
            flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            fd: -1,
        };
        let exported = self.ioctl(DRM_IOCTL_PRIME_HANDLE_TO_FD(), &mut prime);
        self.close_handle(handle);
        exported.map_err(|source| Error::Drm {
            op: "DRM_IOCTL_PRIME_HANDLE_TO_FD",
            source,
        })?;

        debug!(
            "Allocated GEM buffer {handle}: {} bytes, fd {}",
            create.size, prime.fd
        );
        // SAFETY: PRIME_HANDLE_TO_FD succeeded, so `prime.fd` is a fresh
        // descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(prime.fd) };
        Ok(DmaBuf::from_fd(fd, create.size as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemfdAllocator;

    #[test]
    fn test_map_unmap_cycle() {
        let allocator = MemfdAllocator::default();
        let mut buf = allocator.allocate(10_000).unwrap();
        assert_eq!(buf.size(), 12_288);
        assert!(!buf.is_mapped());

        let mut mapping = buf.map().unwrap();
        assert!(buf.is_mapped());
        assert_eq!(mapping.len(), 12_288);
        mapping[0] = 0xa5;
        buf.unmap(mapping);
        assert!(!buf.is_mapped());

        let mapping = buf.map().unwrap();
        assert_eq!(mapping[0], 0xa5);
        buf.unmap(mapping);
    }

    #[test]
    #[should_panic(expected = "mapped twice")]
    fn test_double_map_panics() {
        let allocator = MemfdAllocator::default();
        let mut buf = allocator.allocate(4096).unwrap();
        let _first = buf.map().unwrap();
        let _second = buf.map();
    }

    #[test]
    #[should_panic(expected = "unmapping")]
    fn test_unmap_foreign_mapping_panics() {
        let allocator = MemfdAllocator::default();
        let mut buf = allocator.allocate(4096).unwrap();
        let _live = buf.map().unwrap();
        buf.unmap(MmapMut::map_anon(4096).unwrap());
    }

    #[test]
    fn test_boxed_allocator() {
        let allocator: Box<dyn BufferAllocator> = Box::new(MemfdAllocator::default());
        let buf = allocator.allocate(1).unwrap();
        assert_eq!(buf.size(), 4096);
        assert!(buf.as_raw_fd() >= 0);
    }

    #[test]
    fn test_open_missing_render_node() {
        let err = I915Allocator::open("/nonexistent/renderD200").unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
    }
}
