// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Capture device over driver-allocated (MMAP) buffers
//!
//! By default every slot is mapped once during [`initialize`] and the
//! mapping moves between the pool and the dequeued [`DeviceBuffer`]. In
//! export mode nothing is mapped upfront: each dequeue exports the slot as
//! a DMA-BUF, maps that descriptor for the duration of the lease and drops
//! it again on enqueue.
//!
//! [`initialize`]: BufferDevice::initialize

use std::io;
use std::os::fd::OwnedFd;

use log::debug;
use memmap2::{MmapMut, MmapOptions};

use crate::device::{self, BufferDevice};
use crate::driver::{Direction, Memory, QueueRequest, Readiness, VideoDriver};
use crate::pool::{BufferPool, DeviceBuffer};
use crate::{Error, Result};

const DIRECTION: Direction = Direction::Capture;
const MEMORY: Memory = Memory::Mmap;

pub struct CaptureDeviceMmap<D> {
    driver: D,
    pool: BufferPool,
    export: bool,
    streaming: bool,
}

impl<D: VideoDriver> CaptureDeviceMmap<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            pool: BufferPool::new(),
            export: false,
            streaming: false,
        }
    }

    /// Capture device that maps each buffer through `VIDIOC_EXPBUF` on
    /// dequeue instead of keeping every slot mapped.
    pub fn with_export(driver: D) -> Self {
        Self {
            export: true,
            ..Self::new(driver)
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    fn map_exported(&self, index: u32) -> Result<MmapMut> {
        let length = self.pool.length(index)?;
        let fd = self
            .driver
            .export_buffer(DIRECTION, index)
            .map_err(|source| Error::ExportBuffer { index, source })?;
        map_fd(&fd, length).map_err(|source| Error::Map { index, source })
    }
}

fn map_fd(fd: &OwnedFd, length: usize) -> io::Result<MmapMut> {
    // SAFETY: the descriptor refers to a driver buffer of at least `length`
    // bytes. The mapping keeps the memory alive after the descriptor closes,
    // and the driver only writes to it while the slot is queued.
    unsafe { MmapOptions::new().len(length).map_mut(fd) }
}

impl<D: VideoDriver> BufferDevice for CaptureDeviceMmap<D> {
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
            let mapping = if self.export {
                None
            } else {
                let mapping = self
                    .driver
                    .map_buffer(&query)
                    .map_err(|source| Error::Map { index, source })?;
                Some(mapping)
            };
            debug!(
                "Capture buffer {index}: length {}, offset {:#x}",
                query.length, query.offset
            );
            self.pool.push(query.length as usize, mapping);
        }

        Ok(granted)
    }

    fn start(&mut self) -> Result<()> {
        for index in self.pool.idle() {
            device::queue(
                &self.driver,
                &QueueRequest {
                    direction: DIRECTION,
                    memory: MEMORY,
                    index,
                    bytes_used: 0,
                    dmabuf_fd: None,
                },
            )?;
            self.pool.mark_queued(index)?;
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
        let mut buffer = self.pool.acquire(info.index, info.length as usize)?;
        if self.export {
            let mapping = self.map_exported(info.index)?;
            buffer.set_mapping(mapping);
        }
        let payload = match info.bytes_used {
            0 => buffer.len(),
            used => used as usize,
        };
        buffer.set_bytes_used_unchecked(payload);
        Ok(buffer)
    }

    fn enqueue(&mut self, buffer: DeviceBuffer) -> Result<()> {
        let reclaimed = self.pool.reclaim(buffer)?;
        let index = reclaimed.index;
        if let Some(mapping) = reclaimed.mapping {
            if self.export {
                drop(mapping);
            } else {
                self.pool.store_mapping(index, mapping)?;
            }
        }
        device::queue(
            &self.driver,
            &QueueRequest {
                direction: DIRECTION,
                memory: MEMORY,
                index,
                bytes_used: 0,
                dmabuf_fd: None,
            },
        )?;
        self.pool.mark_queued(index)
    }

    fn wait_ready(&mut self) -> Result<Readiness> {
        device::poll(&self.driver, DIRECTION)
    }
}
