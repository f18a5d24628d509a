/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The display-owned recycling pool that shuttles a GPU-rendered buffer into
//! the fixed-function path on mixed frames. Unlike the sink this is not a
//! real consumer: a buffer claimed from it comes straight back through
//! [`ScratchSource::claim_rendered`], and `release_buffer` returns it to the
//! free list once the composer is done reading it.
//!
//! Render clients may dequeue from other threads, so the pool state sits
//! behind a mutex; every operation is an immediate poll, never a wait.

use std::sync::Arc;

use display_traits::{
    BufferProducer, BufferUsage, DequeuedBuffer, DeviceIntSize, Fence, GraphicBuffer, PixelFormat,
    ProducerApi, QueueBufferInput, QueueBufferOutput, ScratchSource, SurfaceError, SurfaceQuery,
    SurfaceResult,
};
use log::{trace, warn};
use parking_lot::Mutex;

/// Buffers kept in the pool by default; one in flight, one being rendered.
pub const DEFAULT_SCRATCH_DEPTH: usize = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Free,
    Dequeued,
    Claimed,
}

struct PoolSlot {
    phase: Phase,
    buffer: Option<Arc<GraphicBuffer>>,
    /// The fence handed out with the next dequeue of this slot; written by
    /// `release_buffer` so reuse waits for the composer.
    fence: Option<Fence>,
}

impl PoolSlot {
    fn empty() -> PoolSlot {
        PoolSlot {
            phase: Phase::Free,
            buffer: None,
            fence: None,
        }
    }
}

pub struct ScratchPool {
    name: String,
    state: Mutex<Vec<PoolSlot>>,
}

impl ScratchPool {
    pub fn new(name: &str, depth: usize) -> ScratchPool {
        ScratchPool {
            name: format!("{name}:scratch"),
            state: Mutex::new((0..depth.max(1)).map(|_| PoolSlot::empty()).collect()),
        }
    }
}

impl BufferProducer for ScratchPool {
    fn request_buffer(&self, slot: usize) -> SurfaceResult<Arc<GraphicBuffer>> {
        let state = self.state.lock();
        state
            .get(slot)
            .and_then(|s| s.buffer.clone())
            .ok_or(SurfaceError::NoInit)
    }

    fn set_buffer_count(&self, count: usize) -> SurfaceResult<()> {
        if count == 0 {
            return Err(SurfaceError::BadValue);
        }
        let mut state = self.state.lock();
        if state.iter().any(|slot| slot.phase != Phase::Free) {
            return Err(SurfaceError::InvalidOperation);
        }
        state.clear();
        state.extend((0..count).map(|_| PoolSlot::empty()));
        Ok(())
    }

    fn dequeue_buffer(
        &self,
        _asynchronous: bool,
        size: DeviceIntSize,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> SurfaceResult<DequeuedBuffer> {
        let mut state = self.state.lock();
        let Some(slot) = state.iter().position(|slot| slot.phase == Phase::Free) else {
            warn!("[{}] dequeue_buffer: pool exhausted", self.name);
            return Err(SurfaceError::NoMemory);
        };

        let entry = &mut state[slot];
        let wanted_format = match format {
            PixelFormat::Any => entry
                .buffer
                .as_ref()
                .map_or(PixelFormat::Rgba8888, |buffer| buffer.format()),
            other => other,
        };
        let needs_reallocation = entry.buffer.as_ref().is_none_or(|buffer| {
            buffer.size() != size ||
                buffer.format() != wanted_format ||
                !buffer.usage().contains(usage)
        });
        if needs_reallocation {
            entry.buffer = Some(GraphicBuffer::allocate(size, wanted_format, usage));
        }
        entry.phase = Phase::Dequeued;
        let fence = entry.fence.take();
        trace!(
            "[{}] dequeue_buffer: slot={} realloc={}",
            self.name,
            slot,
            needs_reallocation
        );
        Ok(DequeuedBuffer {
            slot,
            fence,
            needs_reallocation,
            release_all_buffers: false,
        })
    }

    /// The pool's consumer side is [`ScratchSource::claim_rendered`]; a
    /// plain queue with no rendezvous has no meaning here.
    fn queue_buffer(
        &self,
        _slot: usize,
        _input: QueueBufferInput,
    ) -> SurfaceResult<QueueBufferOutput> {
        Err(SurfaceError::InvalidOperation)
    }

    fn cancel_buffer(&self, slot: usize, fence: Option<Fence>) {
        let mut state = self.state.lock();
        match state.get_mut(slot) {
            Some(entry) if entry.phase == Phase::Dequeued => {
                entry.phase = Phase::Free;
                entry.fence = fence;
            },
            _ => warn!("[{}] cancel_buffer: slot {} not dequeued", self.name, slot),
        }
    }

    fn query(&self, _what: SurfaceQuery) -> SurfaceResult<u32> {
        Err(SurfaceError::NoInit)
    }

    fn connect(&self, _api: ProducerApi) -> SurfaceResult<QueueBufferOutput> {
        Ok(QueueBufferOutput::default())
    }

    fn disconnect(&self, _api: ProducerApi) -> SurfaceResult<()> {
        Ok(())
    }
}

impl ScratchSource for ScratchPool {
    fn claim_rendered(
        &self,
        slot: usize,
        input: QueueBufferInput,
    ) -> SurfaceResult<(usize, Option<Fence>)> {
        let mut state = self.state.lock();
        match state.get_mut(slot) {
            Some(entry) if entry.phase == Phase::Dequeued => {
                entry.phase = Phase::Claimed;
                trace!("[{}] claim_rendered: slot={}", self.name, slot);
                Ok((slot, input.fence))
            },
            _ => {
                warn!(
                    "[{}] claim_rendered: slot {} was never dequeued",
                    self.name,
                    slot
                );
                Err(SurfaceError::BadValue)
            },
        }
    }

    fn release_buffer(&self, slot: usize, release_fence: Option<Fence>) {
        let mut state = self.state.lock();
        match state.get_mut(slot) {
            Some(entry) if entry.phase == Phase::Claimed => {
                entry.phase = Phase::Free;
                entry.fence = release_fence;
            },
            _ => warn!("[{}] release_buffer: slot {} not claimed", self.name, slot),
        }
    }
}
