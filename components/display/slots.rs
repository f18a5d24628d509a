/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The shared producer-slot table. Two upstream sources with independent
//! slot numbering feed one consumer-visible slot space; the mapping puts
//! sink slots at the bottom of the range and scratch slots at the top, and
//! each slot remembers which source last filled it so a handle dequeued from
//! the other source is recognized as stale.

use std::sync::Arc;

use display_traits::{
    BufferProducer, BufferUsage, CompositionType, DequeuedBuffer, DeviceIntSize, GraphicBuffer,
    PixelFormat, SurfaceResult,
};
use log::{trace, warn};

/// Total producer slots visible to the consumer, shared by both sources.
pub const BUFFER_SLOT_COUNT: usize = 64;

/// The two upstream producers a virtual display multiplexes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Source {
    /// The real external consumer-facing queue.
    Sink,
    /// The internal recycling pool used only for mixed composition.
    Scratch,
}

impl Source {
    pub fn name(self) -> &'static str {
        match self {
            Source::Sink => "SINK",
            Source::Scratch => "SCRATCH",
        }
    }
}

/// Which source supplies the GPU's render-target buffer for a frame. The
/// final output buffer always comes from the sink; the scratch pool only
/// ever holds GPU output that the fixed-function path will fold into a sink
/// buffer afterwards.
pub fn fb_source_for(composition: CompositionType) -> Source {
    if composition == CompositionType::Mixed {
        Source::Scratch
    } else {
        Source::Sink
    }
}

/// Convert between a source's own slot numbering and the shared producer
/// slot space. Self-inverse: the same function performs both directions.
pub fn map_slot(source: Source, slot: usize) -> usize {
    match source {
        Source::Sink => slot,
        Source::Scratch => BUFFER_SLOT_COUNT - slot - 1,
    }
}

#[derive(Clone, Debug, Default)]
struct Slot {
    owner: Option<Source>,
    buffer: Option<Arc<GraphicBuffer>>,
}

/// The consumer-visible buffer table. Owns one handle per producer slot,
/// tagged by the source that last dequeued it.
pub struct SlotTable {
    name: String,
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(name: &str) -> SlotTable {
        SlotTable {
            name: name.to_owned(),
            slots: vec![Slot::default(); BUFFER_SLOT_COUNT],
        }
    }

    pub fn buffer(&self, pslot: usize) -> Option<Arc<GraphicBuffer>> {
        self.slots.get(pslot).and_then(|slot| slot.buffer.clone())
    }

    /// Drop the handle cached for `pslot`. The slot keeps its source tag, so
    /// the next dequeue landing here re-requests a buffer.
    pub fn release(&mut self, pslot: usize) {
        if let Some(slot) = self.slots.get_mut(pslot) {
            slot.buffer = None;
        }
    }

    /// Dequeue the next buffer from `producer` on behalf of `source` and
    /// fold the result into the table. On error the table is untouched and
    /// the source's error propagates verbatim. A slot last filled by the
    /// other source forces a re-request of the handle; if the re-request
    /// fails the slot is cleared, the dequeued buffer is cancelled back, and
    /// the frame (not the table) is lost.
    pub fn dequeue(
        &mut self,
        source: Source,
        producer: &dyn BufferProducer,
        asynchronous: bool,
        size: DeviceIntSize,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> SurfaceResult<DequeuedBuffer> {
        let dequeued = producer.dequeue_buffer(asynchronous, size, format, usage)?;

        let sslot = dequeued.slot;
        let pslot = map_slot(source, sslot);
        trace!(
            "[{}] dequeue({}): sslot={} pslot={}",
            self.name,
            source.name(),
            sslot,
            pslot
        );

        let mut needs_reallocation = dequeued.needs_reallocation;
        if self.slots[pslot].owner != Some(source) {
            // This slot was previously filled from the other source; the
            // handle cached here does not belong to this dequeue.
            needs_reallocation = true;
            self.slots[pslot].owner = Some(source);
        }

        if dequeued.release_all_buffers {
            for slot in self.slots.iter_mut() {
                if slot.owner == Some(source) {
                    slot.buffer = None;
                }
            }
        }

        if needs_reallocation {
            match producer.request_buffer(sslot) {
                Ok(buffer) => {
                    trace!(
                        "[{}] dequeue({}): buffers[{}]={:?} fmt={:?} usage={:?}",
                        self.name,
                        source.name(),
                        pslot,
                        buffer.id(),
                        buffer.format(),
                        buffer.usage()
                    );
                    self.slots[pslot].buffer = Some(buffer);
                },
                Err(error) => {
                    warn!(
                        "[{}] dequeue({}): request_buffer for sslot={} failed: {}",
                        self.name,
                        source.name(),
                        sslot,
                        error
                    );
                    self.release(pslot);
                    producer.cancel_buffer(sslot, dequeued.fence.clone());
                    return Err(error);
                },
            }
        }

        Ok(DequeuedBuffer {
            slot: sslot,
            fence: dequeued.fence,
            needs_reallocation,
            release_all_buffers: dequeued.release_all_buffers,
        })
    }
}
