/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Shared vocabulary for the display subsystem: buffer and fence types, the
//! producer/consumer contracts the virtual-display core is wired into, and
//! the composer-facing query interface. The concrete machinery lives in the
//! `display` component; everything here is the seam between it and its
//! collaborators.

#![deny(unsafe_code)]

mod buffer;

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use euclid::{Box2D, Size2D};

pub use crate::buffer::{
    BufferUsage, DequeuedBuffer, Fence, GraphicBuffer, PixelFormat, QueueBufferInput,
    QueueBufferOutput, ScalingMode,
};

/// The unit of physical display pixels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DevicePixel;

pub type DeviceIntSize = Size2D<i32, DevicePixel>;
pub type DeviceIntBox = Box2D<i32, DevicePixel>;

/// Identifier of a display known to the hardware composer. A virtual display
/// that currently has no consumer attached has no id at all; the routing core
/// treats that as a short-circuit and succeeds without doing work.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DisplayId(pub i32);

/// Which hardware path(s) produce pixels this frame: the GPU alone, the
/// fixed-function composer alone, or a GPU pass composited by the
/// fixed-function path. Decided once per frame in `prepare_frame` and fixed
/// until the next one.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CompositionType {
    #[default]
    Unknown,
    Gpu,
    Overlay,
    Mixed,
}

impl CompositionType {
    pub fn name(self) -> &'static str {
        match self {
            CompositionType::Unknown => "UNKNOWN",
            CompositionType::Gpu => "GPU",
            CompositionType::Overlay => "OVERLAY",
            CompositionType::Mixed => "MIXED",
        }
    }
}

bitflags! {
    /// Axis-aligned orientation bits of a transform. A 180 degree rotation is
    /// the two flips combined; 270 is a quarter turn plus both flips.
    /// `NOT_AXIS_ALIGNED` marks a matrix these bits cannot describe.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct TransformFlags: u32 {
        const FLIP_HORIZONTAL = 1 << 0;
        const FLIP_VERTICAL = 1 << 1;
        const ROTATE_90 = 1 << 2;
        const ROTATE_180 = Self::FLIP_HORIZONTAL.bits() | Self::FLIP_VERTICAL.bits();
        const ROTATE_270 = Self::ROTATE_90.bits() | Self::ROTATE_180.bits();
        const NOT_AXIS_ALIGNED = 1 << 3;
    }
}

/// One of the four display rotations. Anything else coming in over the wire
/// is rejected at the boundary by [`Orientation::from_raw`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Orientation {
    #[default]
    Rot0,
    Rot90,
    Rot180,
    Rot270,
}

impl Orientation {
    pub fn from_raw(raw: u32) -> SurfaceResult<Orientation> {
        match raw {
            0 => Ok(Orientation::Rot0),
            1 => Ok(Orientation::Rot90),
            2 => Ok(Orientation::Rot180),
            3 => Ok(Orientation::Rot270),
            _ => Err(SurfaceError::BadValue),
        }
    }

    pub fn flags(self) -> TransformFlags {
        match self {
            Orientation::Rot0 => TransformFlags::empty(),
            Orientation::Rot90 => TransformFlags::ROTATE_90,
            Orientation::Rot180 => TransformFlags::ROTATE_180,
            Orientation::Rot270 => TransformFlags::ROTATE_270,
        }
    }

    /// True for the rotations that swap a display's width and height.
    pub fn is_quarter_turn(self) -> bool {
        matches!(self, Orientation::Rot90 | Orientation::Rot270)
    }
}

/// The error taxonomy shared by the producer and surface contracts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SurfaceError {
    /// A buffer could not be obtained; the frame is dropped.
    NoMemory,
    /// A permanent capability limitation, not a transient failure.
    InvalidOperation,
    /// An argument outside its legal range.
    BadValue,
    /// The object queried has nothing to answer with (no buffer in the slot,
    /// consumer gone).
    NoInit,
}

impl fmt::Display for SurfaceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let message = match self {
            SurfaceError::NoMemory => "no buffer available",
            SurfaceError::InvalidOperation => "operation not supported",
            SurfaceError::BadValue => "bad value",
            SurfaceError::NoInit => "not initialized",
        };
        f.write_str(message)
    }
}

impl std::error::Error for SurfaceError {}

pub type SurfaceResult<T> = Result<T, SurfaceError>;

/// The client APIs a producer endpoint can be connected to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProducerApi {
    Gpu,
    Cpu,
    Media,
}

/// Queries answerable over the producer interface.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SurfaceQuery {
    Width,
    Height,
    Format,
    ConsumerUsage,
}

/// The standard buffer-producer contract: what a render client sees when it
/// draws into a surface, and what the routing core consumes from its sink.
///
/// Width/height components of zero in `dequeue_buffer` mean "no preference";
/// `PixelFormat::Any` likewise.
pub trait BufferProducer {
    /// Fetch the buffer handle currently backing `slot`. Must follow a
    /// dequeue that reported `needs_reallocation`.
    fn request_buffer(&self, slot: usize) -> SurfaceResult<Arc<GraphicBuffer>>;

    fn set_buffer_count(&self, count: usize) -> SurfaceResult<()>;

    fn dequeue_buffer(
        &self,
        asynchronous: bool,
        size: DeviceIntSize,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> SurfaceResult<DequeuedBuffer>;

    fn queue_buffer(
        &self,
        slot: usize,
        input: QueueBufferInput,
    ) -> SurfaceResult<QueueBufferOutput>;

    fn cancel_buffer(&self, slot: usize, fence: Option<Fence>);

    fn query(&self, what: SurfaceQuery) -> SurfaceResult<u32>;

    fn connect(&self, api: ProducerApi) -> SurfaceResult<QueueBufferOutput>;

    fn disconnect(&self, api: ProducerApi) -> SurfaceResult<()>;

    /// Remove a buffer from the producer's slot table, transferring ownership
    /// to the caller. Endpoints whose slot identity is load-bearing refuse.
    fn detach_buffer(&self, _slot: usize) -> SurfaceResult<()> {
        Err(SurfaceError::InvalidOperation)
    }

    /// Insert a caller-owned buffer into a free slot.
    fn attach_buffer(&self, _buffer: Arc<GraphicBuffer>) -> SurfaceResult<usize> {
        Err(SurfaceError::InvalidOperation)
    }

    /// Route a hardware stream past the buffer queue entirely.
    fn set_sideband_stream(&self, _enabled: bool) -> SurfaceResult<()> {
        Err(SurfaceError::InvalidOperation)
    }

    /// Preallocate buffers matching the given description. Advisory.
    fn allocate_buffers(
        &self,
        _size: DeviceIntSize,
        _format: PixelFormat,
        _usage: BufferUsage,
    ) {
    }

    fn allow_allocation(&self, _allow: bool) -> SurfaceResult<()> {
        Err(SurfaceError::InvalidOperation)
    }
}

/// The scratch pool's contract: a full producer endpoint (the GPU renders
/// into it during mixed frames) plus the one-shot handoff that moves a
/// rendered buffer to the fixed-function path and back.
pub trait ScratchSource: BufferProducer {
    /// Accept the rendered buffer the producer just finished at `slot` and
    /// hand it straight back for fixed-function consumption, returning the
    /// slot and the render-done fence the consumer must wait on. This is the
    /// rendezvous a general queue/acquire pair would otherwise simulate.
    fn claim_rendered(
        &self,
        slot: usize,
        input: QueueBufferInput,
    ) -> SurfaceResult<(usize, Option<Fence>)>;

    /// Return a claimed buffer to the free pool. `release_fence` gates when
    /// the pool may hand the buffer out again.
    fn release_buffer(&self, slot: usize, release_fence: Option<Fence>);
}

/// The slice of the hardware composer the display core consumes: capability
/// bits for the current frame, buffer submission, and the fences that come
/// back after commit.
pub trait HardwareComposer {
    /// Did composition assign any layer of this display to the GPU?
    fn has_gpu_composition(&self, display: DisplayId) -> bool;

    /// Did composition assign any layer of this display to fixed-function
    /// hardware?
    fn has_overlay_composition(&self, display: DisplayId) -> bool;

    /// Bind the buffer the consumer will receive for this frame.
    fn set_output_buffer(
        &self,
        display: DisplayId,
        fence: Option<Fence>,
        buffer: Option<Arc<GraphicBuffer>>,
    ) -> SurfaceResult<()>;

    /// Submit the GPU-rendered buffer the fixed-function path reads during a
    /// mixed frame.
    fn post_framebuffer(
        &self,
        display: DisplayId,
        fence: Option<Fence>,
        buffer: Option<Arc<GraphicBuffer>>,
    ) -> SurfaceResult<()>;

    /// The fence signalled when the composer is done reading the frame's
    /// GPU-rendered input. Consumed on read.
    fn take_release_fence(&self, display: DisplayId) -> Option<Fence>;

    /// The fence signalled when the previous frame left the output.
    fn last_retire_fence(&self, display: DisplayId) -> Option<Fence>;
}

/// The per-refresh contract a display device drives its surface through, in
/// this order, exactly once per refresh:
/// `begin_frame` -> `prepare_frame` -> zero or more render dequeue/queue
/// pairs -> `advance_frame` -> `on_frame_committed`.
pub trait DisplaySurface {
    fn begin_frame(&self, must_recompose: bool) -> SurfaceResult<()>;

    fn prepare_frame(&self, composition: CompositionType) -> SurfaceResult<()>;

    /// Hook invoked when GPU work for the frame has been flushed. No-op for
    /// surfaces with nothing to do there.
    fn composition_complete(&self) -> SurfaceResult<()> {
        Ok(())
    }

    fn advance_frame(&self) -> SurfaceResult<()>;

    fn on_frame_committed(&self);

    fn resize_buffers(&self, size: DeviceIntSize);
}

/// The swap-chain face of a display's GPU surface. Only what the device
/// layer needs: dimensions, recreation at a new size, and the swap itself.
pub trait RenderTarget {
    fn size(&self) -> DeviceIntSize;

    /// Recreate the target at the given size, returning the size actually
    /// granted. Callers must treat a mismatch as a broken driver contract.
    fn resize(&self, size: DeviceIntSize) -> SurfaceResult<DeviceIntSize>;

    fn swap_buffers(&self) -> SurfaceResult<()>;

    fn set_swap_interval(&self, interval: u32);

    fn make_current(&self) -> SurfaceResult<()>;
}
