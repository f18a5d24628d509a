/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Graphics buffer handles, fences, and the parameter structs exchanged over
//! the producer interface.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::{DeviceIntBox, DeviceIntSize, TransformFlags};

/// Pixel formats understood by the composition pipeline. `Any` leaves the
/// choice to the allocator; `ImplementationDefined` defers to whatever the
/// platform picks for the given usage bits.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum PixelFormat {
    #[default]
    Any,
    Rgba8888,
    Rgbx8888,
    Rgb565,
    Yv12,
    ImplementationDefined,
}

impl PixelFormat {
    pub fn to_raw(self) -> u32 {
        match self {
            PixelFormat::Any => 0,
            PixelFormat::Rgba8888 => 1,
            PixelFormat::Rgbx8888 => 2,
            PixelFormat::Rgb565 => 4,
            PixelFormat::Yv12 => 0x3231_5659,
            PixelFormat::ImplementationDefined => 0x22,
        }
    }

    pub fn from_raw(raw: u32) -> Option<PixelFormat> {
        match raw {
            0 => Some(PixelFormat::Any),
            1 => Some(PixelFormat::Rgba8888),
            2 => Some(PixelFormat::Rgbx8888),
            4 => Some(PixelFormat::Rgb565),
            0x3231_5659 => Some(PixelFormat::Yv12),
            0x22 => Some(PixelFormat::ImplementationDefined),
            _ => None,
        }
    }
}

bitflags! {
    /// How a buffer's memory will be touched. Allocators use these to pick a
    /// layout; the routing core uses them to decide when a buffer must be
    /// reallocated for a new consumer.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct BufferUsage: u32 {
        const CPU_READ = 1 << 0;
        const CPU_WRITE = 1 << 1;
        const GPU_RENDER_TARGET = 1 << 2;
        const COMPOSER = 1 << 3;
        const VIDEO_ENCODER = 1 << 4;
    }
}

impl BufferUsage {
    pub fn has_cpu_access(self) -> bool {
        self.intersects(BufferUsage::CPU_READ | BufferUsage::CPU_WRITE)
    }
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// An owned graphics-buffer handle. Allocation is notional: the id stands in
/// for the platform memory handle, and identity (not contents) is what the
/// routing layer cares about.
#[derive(Debug, Eq, PartialEq)]
pub struct GraphicBuffer {
    id: u64,
    size: DeviceIntSize,
    format: PixelFormat,
    usage: BufferUsage,
}

impl GraphicBuffer {
    pub fn allocate(size: DeviceIntSize, format: PixelFormat, usage: BufferUsage) -> Arc<Self> {
        Arc::new(GraphicBuffer {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            size,
            format,
            usage,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> DeviceIntSize {
        self.size
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

/// A sync token gating access to a buffer. Fences are opaque to this crate:
/// they are minted by whichever side finishes work on a buffer and travel
/// with it until the other side is ready. "No fence" is `Option::None`.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Fence {
    id: u64,
}

impl Fence {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Fence {
        Fence {
            id: NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Fence#{}", self.id)
    }
}

/// The result of a successful dequeue. `needs_reallocation` tells the caller
/// the handle it may have cached for this slot is stale and must be
/// re-requested; `release_all_buffers` signals that the producer's whole
/// buffer generation turned over.
#[derive(Clone, Debug)]
pub struct DequeuedBuffer {
    pub slot: usize,
    pub fence: Option<Fence>,
    pub needs_reallocation: bool,
    pub release_all_buffers: bool,
}

/// How queued content should be fitted to the consumer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ScalingMode {
    #[default]
    Freeze,
    ScaleToWindow,
    ScaleCrop,
}

/// Parameters accompanying a queued buffer.
#[derive(Clone, Debug)]
pub struct QueueBufferInput {
    pub crop: DeviceIntBox,
    pub scaling_mode: ScalingMode,
    pub transform: TransformFlags,
    pub asynchronous: bool,
    pub fence: Option<Fence>,
}

impl Default for QueueBufferInput {
    fn default() -> Self {
        QueueBufferInput {
            crop: DeviceIntBox::zero(),
            scaling_mode: ScalingMode::Freeze,
            transform: TransformFlags::empty(),
            asynchronous: false,
            fence: None,
        }
    }
}

/// Consumer feedback returned from `queue_buffer` and `connect`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueueBufferOutput {
    pub size: DeviceIntSize,
    pub transform_hint: TransformFlags,
    pub pending_buffers: u32,
}

impl Default for QueueBufferOutput {
    fn default() -> Self {
        QueueBufferOutput {
            size: DeviceIntSize::zero(),
            transform_hint: TransformFlags::empty(),
            pending_buffers: 0,
        }
    }
}
