// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! V4L2 driver façade
//!
//! [`VideoDriver`] is the narrow set of requests the buffer devices issue
//! against a video node: pool request, buffer query/export/map, queue,
//! dequeue, stream on/off, format set, capability query and readiness
//! polling. [`V4l2Driver`] implements it with real ioctls on an open device
//! node. Tests substitute the scripted driver from the `testing` module.
//!
//! Methods return raw [`io::Error`]s so callers can tell transient errno
//! values (`EINTR`, `EAGAIN`) from fatal ones. The buffer devices convert
//! them into [`crate::Error`].

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::{MmapMut, MmapOptions};
use vmm_sys_util::ioctl::ioctl_with_mut_ref;

use crate::bindings::*;
use crate::format::PixFormat;
use crate::{Error, Result};

/// Streaming direction of a video queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to user space.
    Capture,
    /// User space to device.
    Output,
}

impl Direction {
    /// `enum v4l2_buf_type` value of the single-planar queue.
    pub fn buf_type(self) -> u32 {
        match self {
            Direction::Capture => V4L2_BUF_TYPE_VIDEO_CAPTURE,
            Direction::Output => V4L2_BUF_TYPE_VIDEO_OUTPUT,
        }
    }

    /// `poll(2)` event signalling a completed buffer in this direction.
    pub fn poll_event(self) -> libc::c_short {
        match self {
            Direction::Capture => libc::POLLIN,
            Direction::Output => libc::POLLOUT,
        }
    }
}

/// Backing memory kind of a buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memory {
    /// Driver-allocated memory mapped into the process.
    Mmap,
    /// Externally allocated memory shared through a DMA-BUF descriptor.
    DmaBuf,
}

impl Memory {
    /// `enum v4l2_memory` value.
    pub fn as_raw(self) -> u32 {
        match self {
            Memory::Mmap => V4L2_MEMORY_MMAP,
            Memory::DmaBuf => V4L2_MEMORY_DMABUF,
        }
    }
}

bitflags::bitflags! {
    /// Subset of the `V4L2_CAP_*` flags reported by `VIDIOC_QUERYCAP`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        const VIDEO_CAPTURE = 0x0000_0001;
        const VIDEO_OUTPUT = 0x0000_0002;
        const VIDEO_M2M = 0x0000_8000;
        const READWRITE = 0x0100_0000;
        const STREAMING = 0x0400_0000;
        /// `device_caps` is valid.
        const DEVICE_CAPS = 0x8000_0000;
    }
}

bitflags::bitflags! {
    /// Subset of the `V4L2_BUF_FLAG_*` flags reported on dequeue.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u32 {
        const MAPPED = 0x0000_0001;
        const QUEUED = 0x0000_0002;
        const DONE = 0x0000_0004;
        const KEYFRAME = 0x0000_0008;
        const ERROR = 0x0000_0040;
        const LAST = 0x0010_0000;
    }
}

/// Identity and capabilities of a video node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapability {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub version: u32,
    pub capabilities: Capabilities,
    pub device_caps: Capabilities,
}

impl DeviceCapability {
    /// Capabilities of this particular node, which may be narrower than
    /// those of the physical device.
    pub fn node_caps(&self) -> Capabilities {
        if self.capabilities.contains(Capabilities::DEVICE_CAPS) {
            self.device_caps
        } else {
            self.capabilities
        }
    }

    /// Whether the node can stream in `direction`.
    pub fn supports(&self, direction: Direction) -> bool {
        let caps = self.node_caps();
        let wanted = match direction {
            Direction::Capture => Capabilities::VIDEO_CAPTURE,
            Direction::Output => Capabilities::VIDEO_OUTPUT,
        };
        caps.contains(Capabilities::STREAMING)
            && (caps.contains(wanted) || caps.contains(Capabilities::VIDEO_M2M))
    }
}

/// Result of `VIDIOC_QUERYBUF` for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferQuery {
    pub index: u32,
    pub length: u32,
    /// Mapping cookie for `mmap(2)` (MMAP memory only).
    pub offset: u32,
}

/// Buffer handed back by `VIDIOC_DQBUF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedInfo {
    pub index: u32,
    /// Zero on some drivers (v4l2loopback), see `BufferPool::acquire`.
    pub length: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub flags: BufferFlags,
}

/// Arguments of a `VIDIOC_QBUF` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRequest {
    pub direction: Direction,
    pub memory: Memory,
    pub index: u32,
    pub bytes_used: u32,
    /// DMA-BUF descriptor backing the slot (DMABUF memory only).
    pub dmabuf_fd: Option<RawFd>,
}

/// Outcome of a blocking readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A buffer can be dequeued.
    Ready,
    /// The device reported an error or hang-up: the stream has ended.
    Stopped,
    /// A signal interrupted the wait before the device became ready.
    Interrupted,
}

/// Requests a buffer device issues against a video node.
pub trait VideoDriver: Send {
    fn query_capability(&self) -> io::Result<DeviceCapability>;

    /// Send `format` with `VIDIOC_S_FMT` and return what the driver accepted.
    fn set_format(&self, direction: Direction, format: &PixFormat) -> io::Result<PixFormat>;

    /// Ask for `count` buffers, returning the number actually granted.
    fn request_buffers(&self, direction: Direction, memory: Memory, count: u32) -> io::Result<u32>;

    fn query_buffer(&self, direction: Direction, memory: Memory, index: u32)
    -> io::Result<BufferQuery>;

    /// Map an MMAP buffer described by `query` read-write.
    fn map_buffer(&self, query: &BufferQuery) -> io::Result<MmapMut>;

    /// Export an MMAP buffer as a DMA-BUF descriptor.
    fn export_buffer(&self, direction: Direction, index: u32) -> io::Result<OwnedFd>;

    fn queue_buffer(&self, request: &QueueRequest) -> io::Result<()>;

    /// Issue a single `VIDIOC_DQBUF`. No retry happens here.
    fn dequeue_buffer(&self, direction: Direction, memory: Memory) -> io::Result<DequeuedInfo>;

    fn stream_on(&self, direction: Direction) -> io::Result<()>;

    fn stream_off(&self, direction: Direction) -> io::Result<()>;

    /// Block until a buffer completes in `direction`. No timeout.
    fn poll(&self, direction: Direction) -> io::Result<Readiness>;
}

/// A V4L2 video node opened read-write in blocking mode.
#[derive(Debug)]
pub struct V4l2Driver {
    file: File,
    path: PathBuf,
}

impl V4l2Driver {
    /// Open the video node at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| Error::Open {
                path: path.clone(),
                source,
            })?;
        debug!("Opened {} as fd {}", path.display(), file.as_raw_fd());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl<T>(&self, request: libc::c_ulong, arg: &mut T) -> io::Result<()> {
        // SAFETY: `arg` is the kernel structure `request` was declared with,
        // and the file descriptor stays open for the duration of the call.
        let ret = unsafe { ioctl_with_mut_ref(&self.file, request, arg) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for V4l2Driver {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl VideoDriver for V4l2Driver {
    fn query_capability(&self) -> io::Result<DeviceCapability> {
        let mut cap = v4l2_capability::default();
        self.ioctl(VIDIOC_QUERYCAP(), &mut cap)?;
        Ok(DeviceCapability {
            driver: c_str_field(&cap.driver),
            card: c_str_field(&cap.card),
            bus_info: c_str_field(&cap.bus_info),
            version: cap.version,
            capabilities: Capabilities::from_bits_retain(cap.capabilities),
            device_caps: Capabilities::from_bits_retain(cap.device_caps),
        })
    }

    fn set_format(&self, direction: Direction, format: &PixFormat) -> io::Result<PixFormat> {
        let mut raw = v4l2_format {
            type_: direction.buf_type(),
            ..Default::default()
        };
        raw.fmt.pix = format.to_raw();
        self.ioctl(VIDIOC_S_FMT(), &mut raw)?;
        // SAFETY: single-planar buffer types always fill the `pix` member.
        let pix = unsafe { raw.fmt.pix };
        Ok(PixFormat::from_raw(&pix))
    }

    fn request_buffers(&self, direction: Direction, memory: Memory, count: u32) -> io::Result<u32> {
        let mut reqbuf = v4l2_requestbuffers {
            count,
            type_: direction.buf_type(),
            memory: memory.as_raw(),
            ..Default::default()
        };
        self.ioctl(VIDIOC_REQBUFS(), &mut reqbuf)?;
        Ok(reqbuf.count)
    }

    fn query_buffer(
        &self,
        direction: Direction,
        memory: Memory,
        index: u32,
    ) -> io::Result<BufferQuery> {
        let mut buf = v4l2_buffer {
            index,
            type_: direction.buf_type(),
            memory: memory.as_raw(),
            ..Default::default()
        };
        self.ioctl(VIDIOC_QUERYBUF(), &mut buf)?;
        let offset = match memory {
            // SAFETY: the kernel fills `m.offset` for MMAP buffers.
            Memory::Mmap => unsafe { buf.m.offset },
            Memory::DmaBuf => 0,
        };
        Ok(BufferQuery {
            index,
            length: buf.length,
            offset,
        })
    }

    fn map_buffer(&self, query: &BufferQuery) -> io::Result<MmapMut> {
        // SAFETY: the region belongs to the driver's buffer pool, which stays
        // registered as long as the file is open. The driver is the only
        // other party touching it, and the queue/dequeue handshake orders
        // those accesses.
        unsafe {
            MmapOptions::new()
                .len(query.length as usize)
                .offset(u64::from(query.offset))
                .map_mut(&self.file)
        }
    }

    fn export_buffer(&self, direction: Direction, index: u32) -> io::Result<OwnedFd> {
        let mut expbuf = v4l2_exportbuffer {
            type_: direction.buf_type(),
            index,
            flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            ..Default::default()
        };
        self.ioctl(VIDIOC_EXPBUF(), &mut expbuf)?;
        // SAFETY: the kernel just created this descriptor for us.
        Ok(unsafe { OwnedFd::from_raw_fd(expbuf.fd) })
    }

    fn queue_buffer(&self, request: &QueueRequest) -> io::Result<()> {
        let mut buf = v4l2_buffer {
            index: request.index,
            type_: request.direction.buf_type(),
            memory: request.memory.as_raw(),
            bytesused: request.bytes_used,
            ..Default::default()
        };
        if let Some(fd) = request.dmabuf_fd {
            buf.m.fd = fd;
        }
        self.ioctl(VIDIOC_QBUF(), &mut buf)
    }

    fn dequeue_buffer(&self, direction: Direction, memory: Memory) -> io::Result<DequeuedInfo> {
        let mut buf = v4l2_buffer {
            type_: direction.buf_type(),
            memory: memory.as_raw(),
            ..Default::default()
        };
        self.ioctl(VIDIOC_DQBUF(), &mut buf)?;
        Ok(DequeuedInfo {
            index: buf.index,
            length: buf.length,
            bytes_used: buf.bytesused,
            sequence: buf.sequence,
            flags: BufferFlags::from_bits_retain(buf.flags),
        })
    }

    fn stream_on(&self, direction: Direction) -> io::Result<()> {
        let mut buf_type = direction.buf_type() as libc::c_int;
        self.ioctl(VIDIOC_STREAMON(), &mut buf_type)
    }

    fn stream_off(&self, direction: Direction) -> io::Result<()> {
        let mut buf_type = direction.buf_type() as libc::c_int;
        self.ioctl(VIDIOC_STREAMOFF(), &mut buf_type)
    }

    fn poll(&self, direction: Direction) -> io::Result<Readiness> {
        let event = direction.poll_event();
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: event,
            revents: 0,
        };
        // SAFETY: `pfd` is a valid array of one pollfd for the whole call.
        let ret = unsafe { libc::poll(&mut pfd, 1, -1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::Interrupted);
            }
            return Err(err);
        }
        Ok(classify_revents(event, pfd.revents))
    }
}

/// Map `poll(2)` results onto [`Readiness`]. A requested event wins over
/// error bits so a final buffer is still drained.
pub(crate) fn classify_revents(event: libc::c_short, revents: libc::c_short) -> Readiness {
    if revents & event != 0 {
        Readiness::Ready
    } else if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        Readiness::Stopped
    } else {
        Readiness::Interrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_mapping() {
        assert_eq!(Direction::Capture.buf_type(), V4L2_BUF_TYPE_VIDEO_CAPTURE);
        assert_eq!(Direction::Output.buf_type(), V4L2_BUF_TYPE_VIDEO_OUTPUT);
        assert_eq!(Direction::Capture.poll_event(), libc::POLLIN);
        assert_eq!(Direction::Output.poll_event(), libc::POLLOUT);
    }

    #[test]
    fn test_memory_mapping() {
        assert_eq!(Memory::Mmap.as_raw(), 1);
        assert_eq!(Memory::DmaBuf.as_raw(), 4);
    }

    #[test]
    fn test_classify_revents() {
        assert_eq!(classify_revents(libc::POLLIN, libc::POLLIN), Readiness::Ready);
        assert_eq!(
            classify_revents(libc::POLLIN, libc::POLLIN | libc::POLLERR),
            Readiness::Ready
        );
        assert_eq!(classify_revents(libc::POLLOUT, libc::POLLERR), Readiness::Stopped);
        assert_eq!(classify_revents(libc::POLLOUT, libc::POLLHUP), Readiness::Stopped);
        assert_eq!(classify_revents(libc::POLLIN, 0), Readiness::Interrupted);
    }

    #[test]
    fn test_node_caps_prefers_device_caps() {
        let cap = DeviceCapability {
            driver: "v4l2 loopback".to_string(),
            card: "Dummy video device".to_string(),
            bus_info: "platform:v4l2loopback-000".to_string(),
            version: 0x0006_0000,
            capabilities: Capabilities::DEVICE_CAPS
                | Capabilities::VIDEO_CAPTURE
                | Capabilities::VIDEO_OUTPUT
                | Capabilities::STREAMING,
            device_caps: Capabilities::VIDEO_OUTPUT | Capabilities::STREAMING,
        };
        assert!(cap.supports(Direction::Output));
        assert!(!cap.supports(Direction::Capture));
    }

    #[test]
    fn test_open_missing_node() {
        let err = V4l2Driver::open("/nonexistent/video99").unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
    }
}
