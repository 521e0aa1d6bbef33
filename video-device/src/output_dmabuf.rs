// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Zero-copy output device over shareable (DMABUF) buffers
//!
//! ```text
//!   BufferAllocator ──allocate──▶ DmaBuf[i] ──fd──▶ VIDIOC_QBUF (DMABUF)
//!                                    │
//!                      dequeue: map  │  enqueue: unmap, then QBUF
//!                                    ▼
//!                              DeviceBuffer (CPU view)
//! ```
//!
//! The video driver never allocates memory here: each slot is backed by a
//! buffer from the [`BufferAllocator`], sized to what `VIDIOC_QUERYBUF`
//! reports, and handed over by descriptor on every queue. The CPU mapping
//! only exists between dequeue and enqueue.

use std::os::fd::AsRawFd;

use log::debug;

use crate::device::{self, BufferDevice};
use crate::dmabuf::{BufferAllocator, DmaBuf};
use crate::driver::{Direction, Memory, QueueRequest, Readiness, VideoDriver};
use crate::pool::{BufferPool, DeviceBuffer};
use crate::{Error, Result};

const DIRECTION: Direction = Direction::Output;
const MEMORY: Memory = Memory::DmaBuf;

pub struct OutputDeviceDmabuf<D, A> {
    driver: D,
    allocator: A,
    pool: BufferPool,
    dmabufs: Vec<DmaBuf>,
    streaming: bool,
}

impl<D: VideoDriver, A: BufferAllocator> OutputDeviceDmabuf<D, A> {
    pub fn new(driver: D, allocator: A) -> Self {
        Self {
            driver,
            allocator,
            pool: BufferPool::new(),
            dmabufs: Vec::new(),
            streaming: false,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Whether slot `index` currently has a live CPU mapping.
    pub fn is_mapped(&self, index: u32) -> bool {
        self.dmabufs
            .get(index as usize)
            .is_some_and(DmaBuf::is_mapped)
    }

    fn dmabuf_mut(&mut self, index: u32) -> Result<&mut DmaBuf> {
        let count = self.dmabufs.len() as u32;
        self.dmabufs
            .get_mut(index as usize)
            .ok_or(Error::InvalidIndex { index, count })
    }

    fn queue(&mut self, index: u32, bytes_used: usize) -> Result<()> {
        let fd = self.dmabuf_mut(index)?.as_raw_fd();
        device::queue(
            &self.driver,
            &QueueRequest {
                direction: DIRECTION,
                memory: MEMORY,
                index,
                bytes_used: bytes_used as u32,
                dmabuf_fd: Some(fd),
            },
        )?;
        self.pool.mark_queued(index)
    }
}

impl<D: VideoDriver, A: BufferAllocator> BufferDevice for OutputDeviceDmabuf<D, A> {
    fn direction(&self) -> Direction {
        DIRECTION
    }

    fn memory(&self) -> Memory {
        MEMORY
    }

    fn buffer_count(&self) -> usize {
        self.pool.len()
    }

    fn initialize(&mut self, requested: u32) -> Result<u32> {
        self.pool.clear();
        self.dmabufs.clear();
        let granted = device::request_pool(&self.driver, DIRECTION, MEMORY, requested)?;

        for index in 0..granted {
            let query = self
                .driver
                .query_buffer(DIRECTION, MEMORY, index)
                .map_err(|source| Error::QueryBuffer { index, source })?;
            let dmabuf = self.allocator.allocate(query.length as usize)?;
            debug!(
                "Output buffer {index}: length {}, dmabuf fd {} ({} bytes)",
                query.length,
                dmabuf.as_raw_fd(),
                dmabuf.size()
            );
            self.pool.push(dmabuf.size(), None);
            self.dmabufs.push(dmabuf);
        }

        Ok(granted)
    }

    /// Prime the driver with every idle slot's descriptor, declaring no
    /// payload.
    fn start(&mut self) -> Result<()> {
        for index in self.pool.idle() {
            self.queue(index, 0)?;
        }
        device::stream_on(&self.driver, DIRECTION)?;
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        device::stream_off(&self.driver, DIRECTION)?;
        self.pool.reset();
        self.streaming = false;
        Ok(())
    }

    fn dequeue(&mut self) -> Result<DeviceBuffer> {
        let info = device::dequeue_retrying(&self.driver, DIRECTION, MEMORY)?;
        let index = info.index;
        if self.is_mapped(index) {
            return Err(Error::AlreadyMapped(index));
        }
        let mut buffer = self.pool.acquire(index, info.length as usize)?;
        let mapping = self
            .dmabuf_mut(index)?
            .map()
            .map_err(|source| Error::Map { index, source })?;
        buffer.set_mapping(mapping);
        Ok(buffer)
    }

    fn enqueue(&mut self, buffer: DeviceBuffer) -> Result<()> {
        let reclaimed = self.pool.reclaim(buffer)?;
        let index = reclaimed.index;
        if let Some(mapping) = reclaimed.mapping {
            self.dmabuf_mut(index)?.unmap(mapping);
        }
        self.queue(index, reclaimed.bytes_used)
    }

    fn wait_ready(&mut self) -> Result<Readiness> {
        device::poll(&self.driver, DIRECTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SlotState;
    use crate::testing::{FakeDriver, MemfdAllocator};

    fn started(driver: &FakeDriver, count: u32) -> OutputDeviceDmabuf<FakeDriver, MemfdAllocator> {
        let mut output = OutputDeviceDmabuf::new(driver.clone(), MemfdAllocator::default());
        output.initialize(count).unwrap();
        output.start().unwrap();
        output
    }

    #[test]
    fn test_initialize_allocates_per_slot() {
        let driver = FakeDriver::builder().grant(3).build();
        let allocator = MemfdAllocator::default();
        let mut output = OutputDeviceDmabuf::new(driver.clone(), allocator.clone());
        assert_eq!(output.initialize(10).unwrap(), 3);
        assert_eq!(allocator.allocations(), 3);
        assert!(output.pool().length(0).unwrap() >= driver.buffer_length());
        assert!(!output.is_mapped(0));
    }

    #[test]
    fn test_start_primes_with_descriptors() {
        let driver = FakeDriver::builder().build();
        let _output = started(&driver, 4);
        let log = driver.queued_log();
        assert_eq!(log.len(), 4);
        assert!(log.iter().all(|q| q.bytes_used == 0 && q.dmabuf_fd.is_some()));
    }

    #[test]
    fn test_mapping_lives_only_during_lease() {
        let driver = FakeDriver::builder().build();
        let mut output = started(&driver, 2);

        let mut buffer = output.dequeue().unwrap();
        let index = buffer.index();
        assert!(output.is_mapped(index));
        buffer.data_mut()[..4].copy_from_slice(b"NV12");
        buffer.set_bytes_used(4).unwrap();

        output.enqueue(buffer).unwrap();
        assert!(!output.is_mapped(index));
        assert_eq!(output.pool().state(index).unwrap(), SlotState::Queued);

        let last = *driver.queued_log().last().unwrap();
        assert_eq!(last.index, index);
        assert_eq!(last.bytes_used, 4);
        assert!(last.dmabuf_fd.is_some());
    }

    #[test]
    fn test_dequeue_of_mapped_slot_is_rejected() {
        let driver = FakeDriver::builder().build();
        let mut output = started(&driver, 2);

        let held = output.dequeue().unwrap();
        let index = held.index();
        driver.force_next_dequeue(index);
        assert!(matches!(
            output.dequeue(),
            Err(Error::AlreadyMapped(rejected)) if rejected == index
        ));
        assert!(output.is_mapped(index));

        output.enqueue(held).unwrap();
        assert!(!output.is_mapped(index));
    }

    #[test]
    fn test_allocation_failure_is_fatal() {
        let driver = FakeDriver::builder().buffer_length(0).build();
        let mut output = OutputDeviceDmabuf::new(driver, MemfdAllocator::default());
        assert!(matches!(
            output.initialize(2),
            Err(Error::InvalidAllocation(0))
        ));
    }
}
