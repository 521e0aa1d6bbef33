// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffer slot bookkeeping
//!
//! Every slot of a granted pool is in exactly one of three states:
//!
//! ```text
//!            initialize                 start / enqueue
//!   (none) ────────────▶ Idle ─────────────────────────▶ Queued
//!                          ▲                              │  ▲
//!                     stop │                      dequeue │  │ enqueue
//!                          │                              ▼  │
//!                          └──────────────────────────  Dequeued
//! ```
//!
//! A dequeued slot is represented by a [`DeviceBuffer`] that owns the slot's
//! CPU mapping until it is handed back. Because `enqueue` consumes the
//! `DeviceBuffer`, user code cannot touch the memory after the driver got it
//! back, and cannot hand the same slot back twice.

use log::trace;
use memmap2::MmapMut;

use crate::{Error, Result};

/// Ownership state of one buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Granted but not queued (before `start`, after `stop`).
    Idle,
    /// Owned by the driver.
    Queued,
    /// Held by user space through a [`DeviceBuffer`].
    Dequeued,
}

#[derive(Debug)]
struct Slot {
    length: usize,
    state: SlotState,
    mapping: Option<MmapMut>,
}

/// Slots of one buffer device, indexed by driver buffer index.
#[derive(Debug, Default)]
pub struct BufferPool {
    slots: Vec<Slot>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an idle slot of `length` bytes, optionally with its mapping.
    pub fn push(&mut self, length: usize, mapping: Option<MmapMut>) -> u32 {
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            length,
            state: SlotState::Idle,
            mapping,
        });
        index
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop all slots and their mappings.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    fn slot(&self, index: u32) -> Result<&Slot> {
        self.slots.get(index as usize).ok_or(Error::InvalidIndex {
            index,
            count: self.slots.len() as u32,
        })
    }

    fn slot_mut(&mut self, index: u32) -> Result<&mut Slot> {
        let count = self.slots.len() as u32;
        self.slots
            .get_mut(index as usize)
            .ok_or(Error::InvalidIndex { index, count })
    }

    pub fn state(&self, index: u32) -> Result<SlotState> {
        Ok(self.slot(index)?.state)
    }

    /// Length recorded when the slot was set up.
    pub fn length(&self, index: u32) -> Result<usize> {
        Ok(self.slot(index)?.length)
    }

    /// Indices of all slots currently idle.
    pub fn idle(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == SlotState::Idle)
            .map(|(index, _)| index as u32)
            .collect()
    }

    /// Number of slots currently in `state`.
    pub fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    /// Record that the driver accepted slot `index`.
    pub fn mark_queued(&mut self, index: u32) -> Result<()> {
        let slot = self.slot_mut(index)?;
        if slot.state == SlotState::Queued {
            return Err(Error::NotDequeued(index));
        }
        slot.state = SlotState::Queued;
        Ok(())
    }

    /// Return every slot to `Idle` after the driver released its buffers.
    ///
    /// Buffers still held by user space keep their `DeviceBuffer`; handing
    /// one back later simply requeues it.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            if slot.state == SlotState::Queued {
                slot.state = SlotState::Idle;
            }
        }
    }

    /// Hand slot `index`, just returned by the driver, to user space.
    ///
    /// `reported_len` is the length the driver reported on dequeue. Some
    /// drivers report zero, in which case the length recorded at setup is
    /// used. A length larger than the slot is clamped to it.
    pub fn acquire(&mut self, index: u32, reported_len: usize) -> Result<DeviceBuffer> {
        let slot = self.slot_mut(index)?;
        if slot.state != SlotState::Queued {
            return Err(Error::AlreadyDequeued(index));
        }
        let length = if reported_len == 0 {
            slot.length
        } else {
            reported_len.min(slot.length)
        };
        slot.state = SlotState::Dequeued;
        trace!("Acquired buffer {index}, length {length}");
        Ok(DeviceBuffer {
            index,
            length,
            bytes_used: 0,
            mapping: slot.mapping.take(),
        })
    }

    /// Take `buffer` back from user space.
    ///
    /// The slot stays `Dequeued` until [`mark_queued`](Self::mark_queued),
    /// so a failing `VIDIOC_QBUF` leaves it owned by nobody but us.
    /// Returns the mapping the buffer carried, for the caller to either
    /// keep in the slot or release.
    pub fn reclaim(&mut self, buffer: DeviceBuffer) -> Result<Reclaimed> {
        let slot = self.slot_mut(buffer.index)?;
        if slot.state == SlotState::Queued {
            return Err(Error::NotDequeued(buffer.index));
        }
        Ok(Reclaimed {
            index: buffer.index,
            bytes_used: buffer.bytes_used,
            mapping: buffer.mapping,
        })
    }

    /// Park `mapping` in slot `index` while the driver owns the buffer.
    pub fn store_mapping(&mut self, index: u32, mapping: MmapMut) -> Result<()> {
        self.slot_mut(index)?.mapping = Some(mapping);
        Ok(())
    }

    pub fn has_mapping(&self, index: u32) -> Result<bool> {
        Ok(self.slot(index)?.mapping.is_some())
    }
}

/// A buffer taken back from user space by [`BufferPool::reclaim`].
#[derive(Debug)]
pub struct Reclaimed {
    pub index: u32,
    pub bytes_used: usize,
    pub mapping: Option<MmapMut>,
}

/// A dequeued buffer, owned by user space until handed back with
/// `BufferDevice::enqueue`.
#[must_use = "a dequeued buffer must be handed back with enqueue"]
#[derive(Debug)]
pub struct DeviceBuffer {
    index: u32,
    length: usize,
    bytes_used: usize,
    mapping: Option<MmapMut>,
}

impl DeviceBuffer {
    /// Driver buffer index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Payload size in bytes.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Set the payload size to report to the driver on enqueue.
    pub fn set_bytes_used(&mut self, bytes_used: usize) -> Result<()> {
        if bytes_used > self.length {
            return Err(Error::BufferTooSmall {
                needed: bytes_used,
                capacity: self.length,
            });
        }
        self.bytes_used = bytes_used;
        Ok(())
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Buffer contents. Empty if the buffer carries no CPU mapping.
    pub fn data(&self) -> &[u8] {
        match &self.mapping {
            Some(mapping) => &mapping[..self.length.min(mapping.len())],
            None => &[],
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.mapping {
            Some(mapping) => {
                let end = self.length.min(mapping.len());
                &mut mapping[..end]
            }
            None => &mut [],
        }
    }

    pub(crate) fn set_mapping(&mut self, mapping: MmapMut) {
        self.mapping = Some(mapping);
    }

    pub(crate) fn set_bytes_used_unchecked(&mut self, bytes_used: usize) {
        self.bytes_used = bytes_used.min(self.length);
    }
}
