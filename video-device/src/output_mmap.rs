// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Output device over driver-allocated (MMAP) buffers.

use log::debug;

use crate::device::{self, BufferDevice};
use crate::driver::{Direction, Memory, QueueRequest, Readiness, VideoDriver};
use crate::pool::{BufferPool, DeviceBuffer};
use crate::{Error, Result};

const DIRECTION: Direction = Direction::Output;
const MEMORY: Memory = Memory::Mmap;

/// Every slot stays mapped for the lifetime of the pool. The caller fills a
/// dequeued buffer, declares its payload with
/// [`DeviceBuffer::set_bytes_used`] and hands it back.
pub struct OutputDeviceMmap<D> {
    driver: D,
    pool: BufferPool,
    streaming: bool,
}

impl<D: VideoDriver> OutputDeviceMmap<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            pool: BufferPool::new(),
            streaming: false,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    fn queue(&mut self, index: u32, bytes_used: usize) -> Result<()> {
        device::queue(
            &self.driver,
            &QueueRequest {
                direction: DIRECTION,
                memory: MEMORY,
                index,
                bytes_used: bytes_used as u32,
                dmabuf_fd: None,
            },
        )?;
        self.pool.mark_queued(index)
    }
}

impl<D: VideoDriver> BufferDevice for OutputDeviceMmap<D> {
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
        let granted = device::request_pool(&self.driver, DIRECTION, MEMORY, requested)?;

        for index in 0..granted {
            let query = self
                .driver
                .query_buffer(DIRECTION, MEMORY, index)
                .map_err(|source| Error::QueryBuffer { index, source })?;
            let mapping = self
                .driver
                .map_buffer(&query)
                .map_err(|source| Error::Map { index, source })?;
            debug!(
                "Output buffer {index}: length {}, offset {:#x}",
                query.length, query.offset
            );
            self.pool.push(query.length as usize, Some(mapping));
        }

        Ok(granted)
    }

    /// Prime the driver with every idle slot, declaring no payload.
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
        self.pool.acquire(info.index, info.length as usize)
    }

    fn enqueue(&mut self, buffer: DeviceBuffer) -> Result<()> {
        let reclaimed = self.pool.reclaim(buffer)?;
        if let Some(mapping) = reclaimed.mapping {
            self.pool.store_mapping(reclaimed.index, mapping)?;
        }
        self.queue(reclaimed.index, reclaimed.bytes_used)
    }

    fn wait_ready(&mut self) -> Result<Readiness> {
        device::poll(&self.driver, DIRECTION)
    }
}
