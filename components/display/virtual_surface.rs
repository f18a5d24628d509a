/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The buffer-routing intermediary for a virtual display. It faces two ways:
//! the driver loop walks it through the per-refresh surface protocol, and
//! the GPU render client talks to it as an ordinary buffer producer. Between
//! the two it multiplexes the external sink and the internal scratch pool
//! onto one consumer-visible slot space, picking the right source for each
//! frame's composition type.
//!
//! The composer writes into sink buffers directly whenever it can; only
//! content that the GPU produced and the fixed-function path must still fold
//! in takes the detour through the scratch pool. The final output buffer
//! handed to the consumer therefore always comes from the sink.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use display_traits::{
    BufferProducer, BufferUsage, CompositionType, DequeuedBuffer, DeviceIntBox, DeviceIntSize,
    DisplayId, DisplaySurface, Fence, GraphicBuffer, HardwareComposer, PixelFormat, ProducerApi,
    QueueBufferInput, QueueBufferOutput, ScalingMode, ScratchSource, SurfaceError, SurfaceQuery,
    SurfaceResult,
};
use euclid::Size2D;
use log::{debug, error, trace, warn};

use crate::frame::{BufferBinding, FrameContext, FrameState, FrameTracker};
use crate::slots::{Source, SlotTable, fb_source_for, map_slot};

/// Tunables for a virtual display surface.
#[derive(Clone, Copy, Debug)]
pub struct SurfaceOptions {
    /// Force mixed composition when a frame would otherwise be GPU-only, so
    /// a fixed-function copy performs the format conversion (e.g. RGB to
    /// YUV) instead of the GPU handing RGB straight to the consumer. Costs
    /// an extra copy on consumers that take RGB cheaply.
    pub force_hardware_copy: bool,
    /// Buffers kept in the scratch pool.
    pub scratch_depth: usize,
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        SurfaceOptions {
            force_hardware_copy: false,
            scratch_depth: crate::scratch::DEFAULT_SCRATCH_DEPTH,
        }
    }
}

pub struct VirtualDisplaySurface {
    composer: Rc<dyn HardwareComposer>,
    /// `None` while the virtual display has no consumer attached; every
    /// surface-protocol entry point short-circuits in that state.
    display: Option<DisplayId>,
    name: String,
    sink: Rc<dyn BufferProducer>,
    scratch: Rc<dyn ScratchSource>,
    force_hardware_copy: bool,

    /// The format requested from the sink when the GPU is not rendering
    /// into it, fixed at construction from the consumer's declared needs.
    default_output_format: PixelFormat,
    sink_size: Cell<DeviceIntSize>,
    output_format: Cell<PixelFormat>,
    output_usage: Cell<BufferUsage>,

    slots: RefCell<SlotTable>,
    tracker: RefCell<FrameTracker>,
    queue_output: Cell<QueueBufferOutput>,
    /// Last composition type we logged a change for.
    last_composition: Cell<CompositionType>,
}

impl VirtualDisplaySurface {
    pub fn new(
        composer: Rc<dyn HardwareComposer>,
        display: Option<DisplayId>,
        sink: Rc<dyn BufferProducer>,
        scratch: Rc<dyn ScratchSource>,
        name: &str,
        options: SurfaceOptions,
    ) -> VirtualDisplaySurface {
        let width = sink.query(SurfaceQuery::Width).unwrap_or(0) as i32;
        let height = sink.query(SurfaceQuery::Height).unwrap_or(0) as i32;

        // Pick the format to request from the sink when not rendering to it
        // with the GPU. A consumer that reads with the CPU gets the format
        // it configured; otherwise the allocator decides from the usage
        // bits.
        let consumer_usage = sink
            .query(SurfaceQuery::ConsumerUsage)
            .map(BufferUsage::from_bits_truncate)
            .unwrap_or_default();
        let default_output_format = if consumer_usage.has_cpu_access() {
            sink.query(SurfaceQuery::Format)
                .ok()
                .and_then(PixelFormat::from_raw)
                .unwrap_or(PixelFormat::ImplementationDefined)
        } else {
            PixelFormat::ImplementationDefined
        };

        VirtualDisplaySurface {
            composer,
            display,
            name: name.to_owned(),
            sink,
            scratch,
            force_hardware_copy: options.force_hardware_copy,
            default_output_format,
            sink_size: Cell::new(Size2D::new(width, height)),
            output_format: Cell::new(default_output_format),
            output_usage: Cell::new(BufferUsage::COMPOSER),
            slots: RefCell::new(SlotTable::new(name)),
            tracker: RefCell::new(FrameTracker::default()),
            queue_output: Cell::new(QueueBufferOutput {
                size: Size2D::new(width, height),
                ..Default::default()
            }),
            last_composition: Cell::new(CompositionType::Gpu),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn source(&self, source: Source) -> &dyn BufferProducer {
        match source {
            Source::Sink => &*self.sink,
            Source::Scratch => &*self.scratch,
        }
    }

    /// Dequeue from `source` through the slot table, using the sink's
    /// dimensions. The sink is always dequeued asynchronously so a slow
    /// consumer cannot stall composition.
    fn dequeue_from_source(
        &self,
        source: Source,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> SurfaceResult<DequeuedBuffer> {
        let asynchronous = source == Source::Sink;
        self.slots.borrow_mut().dequeue(
            source,
            self.source(source),
            asynchronous,
            self.sink_size.get(),
            format,
            usage,
        )
    }

    /// Replace the frame's bound output buffer with a fresh sink dequeue at
    /// the current format/usage. A previously bound, still-unqueued buffer
    /// is first cancelled back with its pending fence so it cannot leak;
    /// this also reclaims the binding a failed frame left behind.
    ///
    /// The composer learns the new buffer immediately but with no fence: on
    /// a pure-GPU frame the real fence only exists once the render client
    /// queues, and `advance_frame` supplies it either way.
    ///
    /// Returns whether the consumer-visible handle changed.
    fn refresh_output_buffer(&self) -> SurfaceResult<bool> {
        let previous = {
            let mut tracker = self.tracker.borrow_mut();
            let Some(frame) = tracker.frame.as_mut() else {
                warn!("[{}] refresh_output_buffer with no frame begun", self.name);
                return Err(SurfaceError::NoInit);
            };
            frame.output.take()
        };
        if let Some(binding) = previous {
            self.sink
                .cancel_buffer(map_slot(Source::Sink, binding.pslot), binding.fence);
        }

        let dequeued = self.dequeue_from_source(
            Source::Sink,
            self.output_format.get(),
            self.output_usage.get(),
        )?;
        let pslot = map_slot(Source::Sink, dequeued.slot);

        {
            let mut tracker = self.tracker.borrow_mut();
            if let Some(frame) = tracker.frame.as_mut() {
                frame.output = Some(BufferBinding {
                    pslot,
                    fence: dequeued.fence,
                });
            }
        }

        let buffer = self.slots.borrow().buffer(pslot);
        if let Some(display) = self.display {
            self.composer.set_output_buffer(display, None, buffer)?;
        }
        Ok(dequeued.needs_reallocation)
    }

    fn update_queue_output(&self, output: QueueBufferOutput) {
        // The transform hint is the sink's advice to its own producers; the
        // render client sees this surface, not the sink, so the hint is
        // stripped.
        self.queue_output.set(QueueBufferOutput {
            transform_hint: Default::default(),
            ..output
        });
    }
}

impl DisplaySurface for VirtualDisplaySurface {
    fn begin_frame(&self, must_recompose: bool) -> SurfaceResult<()> {
        if self.display.is_none() {
            return Ok(());
        }

        {
            let mut tracker = self.tracker.borrow_mut();
            tracker.expect(&self.name, "begin_frame", &[FrameState::Idle]);
            // A frame that died before commit leaves its output binding in
            // place; carry it into the new frame so the refresh below
            // cancels that buffer back to the sink instead of leaking it.
            let carried = tracker.frame.take().and_then(|stale| stale.output);
            tracker.frame = Some(FrameContext {
                must_recompose,
                output: carried,
                ..Default::default()
            });
            tracker.state = FrameState::Begun;
        }

        self.refresh_output_buffer().map(|_| ())
    }

    fn prepare_frame(&self, composition: CompositionType) -> SurfaceResult<()> {
        if self.display.is_none() {
            return Ok(());
        }

        let composition = if self.force_hardware_copy && composition == CompositionType::Gpu {
            CompositionType::Mixed
        } else {
            composition
        };

        {
            let mut tracker = self.tracker.borrow_mut();
            tracker.expect(&self.name, "prepare_frame", &[FrameState::Begun]);
            tracker.state = FrameState::Prepared;
            if let Some(frame) = tracker.frame.as_mut() {
                frame.composition = composition;
            }
        }

        if composition != self.last_composition.get() {
            debug!(
                "[{}] prepare_frame: composition type changed to {}",
                self.name,
                composition.name()
            );
            self.last_composition.set(composition);
        }

        if composition != CompositionType::Gpu &&
            (self.output_format.get() != self.default_output_format ||
                self.output_usage.get() != BufferUsage::COMPOSER)
        {
            // We just left GPU-only composition; the format and usage the
            // render client negotiated may be wrong for a buffer the
            // fixed-function hardware writes, so fall back to the defaults
            // and rebind. The reverse switch needs nothing here: the render
            // client renegotiates on its next dequeue.
            self.output_format.set(self.default_output_format);
            self.output_usage.set(BufferUsage::COMPOSER);
            if let Err(error) = self.refresh_output_buffer() {
                warn!(
                    "[{}] prepare_frame: output buffer renegotiation failed: {}",
                    self.name,
                    error
                );
            }
        }
        Ok(())
    }

    fn advance_frame(&self) -> SurfaceResult<()> {
        let Some(display) = self.display else {
            return Ok(());
        };

        let (output, fb, composition) = {
            let mut tracker = self.tracker.borrow_mut();
            let composition = tracker
                .frame
                .as_ref()
                .map(|frame| frame.composition)
                .unwrap_or_default();
            let expected = if composition == CompositionType::Overlay {
                FrameState::Prepared
            } else {
                FrameState::Rendered
            };
            tracker.expect(&self.name, "advance_frame", &[expected]);
            tracker.state = FrameState::Submitted;
            let frame = tracker.frame.as_ref();
            (
                frame.and_then(|frame| frame.output.clone()),
                frame.and_then(|frame| frame.fb.clone()),
                composition,
            )
        };

        let Some(output) = output else {
            // Last-chance bailout if something went wrong earlier: if the
            // sink disappeared, dequeues failed and no buffer was ever
            // bound, but the driver loop soldiers on into this call.
            error!("[{}] advance_frame: no output buffer, bailing out", self.name);
            return Err(SurfaceError::NoMemory);
        };
        if composition != CompositionType::Overlay && fb.is_none() {
            error!(
                "[{}] advance_frame: no framebuffer for {} frame, bailing out",
                self.name,
                composition.name()
            );
            return Err(SurfaceError::NoMemory);
        }

        let slots = self.slots.borrow();
        let output_buffer = slots.buffer(output.pslot);
        trace!(
            "[{}] advance_frame: out pslot={} fb pslot={:?}",
            self.name,
            output.pslot,
            fb.as_ref().map(|binding| binding.pslot)
        );

        // The output buffer's acquire fence is only known now, so rebind
        // with it before the composer commits.
        self.composer
            .set_output_buffer(display, output.fence.clone(), output_buffer)?;

        if let Some(fb) = fb {
            let fb_buffer = slots.buffer(fb.pslot);
            self.composer.post_framebuffer(display, fb.fence, fb_buffer)?;
        }
        Ok(())
    }

    fn on_frame_committed(&self) {
        let Some(display) = self.display else {
            return;
        };

        let frame = {
            let mut tracker = self.tracker.borrow_mut();
            tracker.expect(&self.name, "on_frame_committed", &[FrameState::Submitted]);
            tracker.state = FrameState::Idle;
            tracker.frame.take()
        };
        let Some(frame) = frame else {
            warn!("[{}] on_frame_committed with no frame in flight", self.name);
            return;
        };

        let release_fence = self.composer.take_release_fence(display);

        if frame.composition == CompositionType::Mixed {
            if let Some(fb) = &frame.fb {
                // Return the scratch buffer to the pool; the release fence
                // tells the pool when reuse is safe.
                let sslot = map_slot(Source::Scratch, fb.pslot);
                trace!("[{}] on_frame_committed: release scratch sslot={}", self.name, sslot);
                self.scratch.release_buffer(sslot, release_fence);
            }
        }

        if let Some(output) = frame.output {
            let sslot = map_slot(Source::Sink, output.pslot);
            let retire_fence = self.composer.last_retire_fence(display);
            if frame.must_recompose {
                let size = self.sink_size.get();
                let input = QueueBufferInput {
                    crop: DeviceIntBox::from_size(size),
                    scaling_mode: ScalingMode::Freeze,
                    transform: Default::default(),
                    asynchronous: true,
                    fence: retire_fence,
                };
                match self.sink.queue_buffer(sslot, input) {
                    Ok(output) => self.update_queue_output(output),
                    Err(error) => {
                        error!(
                            "[{}] on_frame_committed: queue to sink failed: {}",
                            self.name,
                            error
                        );
                    },
                }
            } else {
                // The display contents did not actually change; we only went
                // through the motions to keep the protocol in step. Cancel
                // instead of queueing so the consumer does not see a frame
                // and trigger another recomposition in an endless loop.
                self.sink.cancel_buffer(sslot, retire_fence);
            }
        }
    }

    fn resize_buffers(&self, size: DeviceIntSize) {
        self.sink_size.set(size);
        let output = self.queue_output.get();
        self.queue_output.set(QueueBufferOutput { size, ..output });
    }
}

impl BufferProducer for VirtualDisplaySurface {
    fn request_buffer(&self, pslot: usize) -> SurfaceResult<Arc<GraphicBuffer>> {
        if self.display.is_none() {
            return self.sink.request_buffer(pslot);
        }
        self.tracker
            .borrow()
            .expect(&self.name, "request_buffer", &[FrameState::Rendering]);
        self.slots.borrow().buffer(pslot).ok_or(SurfaceError::NoInit)
    }

    fn set_buffer_count(&self, count: usize) -> SurfaceResult<()> {
        self.sink.set_buffer_count(count)
    }

    fn dequeue_buffer(
        &self,
        asynchronous: bool,
        size: DeviceIntSize,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> SurfaceResult<DequeuedBuffer> {
        if self.display.is_none() {
            return self.sink.dequeue_buffer(asynchronous, size, format, usage);
        }

        let composition = {
            let mut tracker = self.tracker.borrow_mut();
            tracker.expect(
                &self.name,
                "dequeue_buffer",
                &[FrameState::Prepared, FrameState::Rendering],
            );
            tracker.state = FrameState::Rendering;
            tracker
                .frame
                .as_ref()
                .map(|frame| frame.composition)
                .unwrap_or_default()
        };
        if !asynchronous {
            warn!(
                "[{}] render client called dequeue_buffer without async despite swap interval 0",
                self.name
            );
        }
        trace!(
            "[{}] dequeue_buffer(render): {}x{} fmt={:?} usage={:?}",
            self.name,
            size.width,
            size.height,
            format,
            usage
        );

        let source = fb_source_for(composition);
        if source == Source::Scratch {
            let dequeued = self.dequeue_from_source(source, format, usage)?;
            return Ok(DequeuedBuffer {
                slot: map_slot(source, dequeued.slot),
                ..dequeued
            });
        }

        // GPU-only frame: the render client draws straight into the sink
        // buffer bound at begin_frame. If it wants something incompatible,
        // cancel that buffer and bind a fresh one. The composer sees a
        // different output buffer between prepare and commit, but in
        // GPU-only mode nothing reads it before commit anyway.
        let bound = {
            let tracker = self.tracker.borrow();
            let Some(frame) = tracker.frame.as_ref() else {
                error!("[{}] dequeue_buffer: no frame begun", self.name);
                return Err(SurfaceError::NoMemory);
            };
            frame.output.clone()
        };
        let Some(bound) = bound else {
            // Same last-chance bailout as advance_frame: the sink vanished
            // earlier and begin_frame could not bind a buffer.
            error!("[{}] dequeue_buffer: no buffer, bailing out", self.name);
            return Err(SurfaceError::NoMemory);
        };

        let usage = usage | BufferUsage::COMPOSER;
        let sink_size = self.sink_size.get();
        let mut needs_reallocation = false;
        let compatible = self.slots.borrow().buffer(bound.pslot).is_some_and(|buffer| {
            buffer.usage().contains(usage) &&
                (format == PixelFormat::Any || format == buffer.format()) &&
                (size.width == 0 || size.width == sink_size.width) &&
                (size.height == 0 || size.height == sink_size.height)
        });
        if !compatible {
            debug!(
                "[{}] dequeue_buffer: replacing output buffer: want {}x{} fmt={:?} usage={:?}",
                self.name,
                size.width,
                size.height,
                format,
                usage
            );
            self.output_format.set(format);
            self.output_usage.set(usage);
            needs_reallocation = self.refresh_output_buffer()?;
        }

        let tracker = self.tracker.borrow();
        let binding = tracker
            .frame
            .as_ref()
            .and_then(|frame| frame.output.as_ref())
            .ok_or(SurfaceError::NoMemory)?;
        Ok(DequeuedBuffer {
            slot: binding.pslot,
            fence: binding.fence.clone(),
            needs_reallocation,
            release_all_buffers: false,
        })
    }

    fn queue_buffer(
        &self,
        pslot: usize,
        input: QueueBufferInput,
    ) -> SurfaceResult<QueueBufferOutput> {
        if self.display.is_none() {
            return self.sink.queue_buffer(pslot, input);
        }

        let composition = {
            let mut tracker = self.tracker.borrow_mut();
            tracker.expect(&self.name, "queue_buffer", &[FrameState::Rendering]);
            tracker.state = FrameState::Rendered;
            tracker
                .frame
                .as_ref()
                .map(|frame| frame.composition)
                .unwrap_or_default()
        };
        trace!("[{}] queue_buffer: pslot={}", self.name, pslot);

        match composition {
            CompositionType::Mixed => {
                // Hand the rendered buffer to the scratch pool and take it
                // straight back as this frame's fixed-function input.
                let sslot = map_slot(Source::Scratch, pslot);
                let (claimed, fence) = self.scratch.claim_rendered(sslot, input)?;
                if claimed != sslot {
                    warn!(
                        "[{}] queue_buffer: claimed sslot {} after rendering sslot {}",
                        self.name,
                        claimed,
                        sslot
                    );
                }
                let mut tracker = self.tracker.borrow_mut();
                if let Some(frame) = tracker.frame.as_mut() {
                    frame.fb = Some(BufferBinding {
                        pslot: map_slot(Source::Scratch, claimed),
                        fence,
                    });
                }
            },
            CompositionType::Gpu => {
                // The render-done fence doubles as the output buffer's
                // acquire fence: the rendered buffer is the output buffer.
                let fence = input.fence;
                let mut tracker = self.tracker.borrow_mut();
                if let Some(frame) = tracker.frame.as_mut() {
                    frame.fb = Some(BufferBinding {
                        pslot,
                        fence: fence.clone(),
                    });
                    match frame.output.as_mut() {
                        Some(output) => output.fence = fence,
                        None => warn!(
                            "[{}] queue_buffer: no output binding for GPU frame",
                            self.name
                        ),
                    }
                }
            },
            other => {
                debug_assert!(false, "queue_buffer on a {} frame", other.name());
                error!(
                    "[{}] queue_buffer: unexpected {} composition",
                    self.name,
                    other.name()
                );
                return Err(SurfaceError::InvalidOperation);
            },
        }

        Ok(self.queue_output.get())
    }

    fn cancel_buffer(&self, pslot: usize, fence: Option<Fence>) {
        if self.display.is_none() {
            return self
                .sink
                .cancel_buffer(map_slot(Source::Sink, pslot), fence);
        }
        self.tracker
            .borrow()
            .expect(&self.name, "cancel_buffer", &[FrameState::Rendering]);
        trace!("[{}] cancel_buffer: pslot={}", self.name, pslot);
        let composition = self
            .tracker
            .borrow()
            .frame
            .as_ref()
            .map(|frame| frame.composition)
            .unwrap_or_default();
        let source = fb_source_for(composition);
        self.source(source)
            .cancel_buffer(map_slot(source, pslot), fence)
    }

    fn query(&self, what: SurfaceQuery) -> SurfaceResult<u32> {
        match what {
            SurfaceQuery::Width => Ok(self.sink_size.get().width as u32),
            SurfaceQuery::Height => Ok(self.sink_size.get().height as u32),
            _ => self.sink.query(what),
        }
    }

    fn connect(&self, api: ProducerApi) -> SurfaceResult<QueueBufferOutput> {
        let output = self.sink.connect(api)?;
        self.update_queue_output(output);
        Ok(self.queue_output.get())
    }

    fn disconnect(&self, api: ProducerApi) -> SurfaceResult<()> {
        self.sink.disconnect(api)
    }

    // Buffers must keep their slot identity for source routing to work, so
    // the detach/attach family is permanently unsupported here.

    fn detach_buffer(&self, _slot: usize) -> SurfaceResult<()> {
        error!("[{}] detach_buffer is not available", self.name);
        Err(SurfaceError::InvalidOperation)
    }

    fn attach_buffer(&self, _buffer: Arc<GraphicBuffer>) -> SurfaceResult<usize> {
        error!("[{}] attach_buffer is not available", self.name);
        Err(SurfaceError::InvalidOperation)
    }

    fn set_sideband_stream(&self, _enabled: bool) -> SurfaceResult<()> {
        Err(SurfaceError::InvalidOperation)
    }

    fn allocate_buffers(
        &self,
        _size: DeviceIntSize,
        _format: PixelFormat,
        _usage: BufferUsage,
    ) {
        // Preallocation is pointless for a virtual display: the sink owns
        // the real buffers and hands them out on demand.
    }

    fn allow_allocation(&self, _allow: bool) -> SurfaceResult<()> {
        Err(SurfaceError::InvalidOperation)
    }
}
