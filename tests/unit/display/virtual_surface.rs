/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::rc::Rc;

use display::{BUFFER_SLOT_COUNT, SurfaceOptions, VirtualDisplaySurface};
use display_traits::{
    BufferProducer, BufferUsage, CompositionType, DisplayId, DisplaySurface, Fence, PixelFormat,
    ProducerApi, QueueBufferInput, SurfaceError, SurfaceQuery, TransformFlags,
};
use euclid::Size2D;

use crate::common::{CountingScratch, FakeComposer, FakeSink, init_logging, sink_size};

struct Rig {
    sink: Rc<FakeSink>,
    composer: Rc<FakeComposer>,
    scratch: Rc<CountingScratch>,
    surface: VirtualDisplaySurface,
}

fn rig_with(options: SurfaceOptions, display: Option<DisplayId>) -> Rig {
    init_logging();
    let sink = FakeSink::new();
    let composer = FakeComposer::new();
    let scratch = CountingScratch::new(options.scratch_depth);
    let surface = VirtualDisplaySurface::new(
        composer.clone(),
        display,
        sink.clone(),
        scratch.clone(),
        "vd-0",
        options,
    );
    Rig {
        sink,
        composer,
        scratch,
        surface,
    }
}

fn rig() -> Rig {
    rig_with(SurfaceOptions::default(), Some(DisplayId(5)))
}

fn render_input(fence: Fence) -> QueueBufferInput {
    QueueBufferInput {
        asynchronous: true,
        fence: Some(fence),
        ..Default::default()
    }
}

#[test]
fn disconnected_display_short_circuits() {
    let rig = rig_with(SurfaceOptions::default(), None);
    assert_eq!(rig.surface.begin_frame(true), Ok(()));
    assert_eq!(rig.surface.prepare_frame(CompositionType::Overlay), Ok(()));
    assert_eq!(rig.surface.composition_complete(), Ok(()));
    assert_eq!(rig.surface.advance_frame(), Ok(()));
    rig.surface.on_frame_committed();

    assert_eq!(rig.sink.dequeue_count(), 0);
    assert_eq!(rig.sink.queued_count(), 0);
    assert!(rig.composer.output_calls().is_empty());
    assert!(rig.composer.fb_posts().is_empty());
    assert_eq!(rig.scratch.claims.get(), 0);
}

#[test]
fn disconnected_producer_calls_forward_to_sink() {
    let rig = rig_with(SurfaceOptions::default(), None);
    let dequeued = rig
        .surface
        .dequeue_buffer(
            true,
            sink_size(),
            PixelFormat::Rgba8888,
            BufferUsage::GPU_RENDER_TARGET,
        )
        .expect("forwarded dequeue");
    assert_eq!(rig.sink.dequeue_count(), 1);
    rig.surface
        .queue_buffer(dequeued.slot, render_input(Fence::new()))
        .expect("forwarded queue");
    assert_eq!(rig.sink.queued_count(), 1);
}

#[test]
fn pure_overlay_frame() {
    let rig = rig();
    let retire = Fence::new();
    rig.composer.set_retire_fence(retire.clone());

    assert_eq!(rig.surface.begin_frame(true), Ok(()));
    // The frame's output buffer is bound up front, without a fence: the
    // composer needs the handle for prepare, and the real fence is only
    // known at submission.
    assert_eq!(rig.sink.dequeue_count(), 1);
    let bind_fence = rig.sink.last_dequeue_fence();

    assert_eq!(rig.surface.prepare_frame(CompositionType::Overlay), Ok(()));
    assert_eq!(rig.surface.advance_frame(), Ok(()));
    rig.surface.on_frame_committed();

    // No GPU round trip happened.
    assert!(rig.composer.fb_posts().is_empty());
    assert_eq!(rig.scratch.claims.get(), 0);

    // Bound once at begin (fenceless) and submitted once with the dequeue
    // fence, both with the same sink buffer.
    let outputs = rig.composer.output_calls();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].0, None);
    assert_eq!(outputs[1].0, bind_fence);
    let bound = outputs[0].1.as_ref().expect("buffer bound at begin");
    let submitted = outputs[1].1.as_ref().expect("buffer submitted");
    assert_eq!(bound.id(), submitted.id());

    // The frame went to the consumer exactly once, gated on the retire
    // fence of the previous frame.
    assert_eq!(rig.sink.queued_count(), 1);
    let (_, input) = rig.sink.last_queued().expect("queued frame");
    assert_eq!(input.fence, Some(retire));
}

#[test]
fn mixed_frame_routes_gpu_output_through_scratch() {
    let rig = rig();
    let release = Fence::new();
    rig.composer.set_release_fence(release.clone());

    assert_eq!(rig.surface.begin_frame(true), Ok(()));
    let output_fence = rig.sink.last_dequeue_fence();
    assert_eq!(rig.surface.prepare_frame(CompositionType::Mixed), Ok(()));

    // The render target for a mixed frame comes from the scratch pool, at
    // the top of the producer slot range.
    let dequeued = rig
        .surface
        .dequeue_buffer(
            true,
            sink_size(),
            PixelFormat::Rgba8888,
            BufferUsage::GPU_RENDER_TARGET,
        )
        .expect("render dequeue");
    assert!(dequeued.slot >= BUFFER_SLOT_COUNT - 2);

    let render_done = Fence::new();
    rig.surface
        .queue_buffer(dequeued.slot, render_input(render_done.clone()))
        .expect("render queue");
    assert_eq!(rig.scratch.claims.get(), 1);

    assert_eq!(rig.surface.advance_frame(), Ok(()));

    // The fixed-function path reads the scratch-sourced buffer gated on the
    // render fence; the consumer gets the sink-sourced buffer.
    let posts = rig.composer.fb_posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, Some(render_done));
    let fb = posts[0].1.as_ref().expect("framebuffer posted");
    assert_eq!(fb.format(), PixelFormat::Rgba8888);

    let outputs = rig.composer.output_calls();
    let submitted = outputs.last().expect("output submitted");
    assert_eq!(submitted.0, output_fence);
    let out_buffer = submitted.1.as_ref().expect("output buffer");
    assert_ne!(out_buffer.id(), fb.id());

    rig.surface.on_frame_committed();
    // The scratch buffer went back to the pool with the composer's release
    // fence; the sink buffer was queued to the consumer.
    assert_eq!(rig.scratch.releases.get(), 1);
    assert_eq!(rig.scratch.released_fences(), vec![Some(release)]);
    assert_eq!(rig.sink.queued_count(), 1);
}

#[test]
fn gpu_frame_adopts_render_fence_for_output() {
    let rig = rig();
    assert_eq!(rig.surface.begin_frame(true), Ok(()));
    assert_eq!(rig.surface.prepare_frame(CompositionType::Gpu), Ok(()));

    // The render client wants a concrete format; the buffer bound at begin
    // was allocated for the composer, so it is replaced.
    let dequeued = rig
        .surface
        .dequeue_buffer(
            true,
            sink_size(),
            PixelFormat::Rgba8888,
            BufferUsage::GPU_RENDER_TARGET,
        )
        .expect("render dequeue");
    assert!(dequeued.slot < BUFFER_SLOT_COUNT - 2);
    assert_eq!(rig.sink.dequeue_count(), 2);
    assert_eq!(rig.sink.cancelled().len(), 1);

    let render_done = Fence::new();
    rig.surface
        .queue_buffer(dequeued.slot, render_input(render_done.clone()))
        .expect("render queue");
    assert_eq!(rig.surface.advance_frame(), Ok(()));

    // The rendered buffer is the output buffer: it is submitted with the
    // render-done fence and also posted as the frame's framebuffer.
    let outputs = rig.composer.output_calls();
    let submitted = outputs.last().expect("output submitted");
    assert_eq!(submitted.0, Some(render_done.clone()));
    let posts = rig.composer.fb_posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].0, Some(render_done));
    assert_eq!(
        posts[0].1.as_ref().map(|buffer| buffer.id()),
        submitted.1.as_ref().map(|buffer| buffer.id()),
    );

    rig.surface.on_frame_committed();
    assert_eq!(rig.sink.queued_count(), 1);
}

#[test]
fn composition_change_renegotiates_output_buffer_once() {
    let rig = rig();

    // Frame N: GPU-only, which drags the output format to what the render
    // client asked for.
    assert_eq!(rig.surface.begin_frame(true), Ok(()));
    assert_eq!(rig.surface.prepare_frame(CompositionType::Gpu), Ok(()));
    let dequeued = rig
        .surface
        .dequeue_buffer(
            true,
            sink_size(),
            PixelFormat::Rgba8888,
            BufferUsage::GPU_RENDER_TARGET,
        )
        .expect("render dequeue");
    rig.surface
        .queue_buffer(dequeued.slot, render_input(Fence::new()))
        .expect("render queue");
    assert_eq!(rig.surface.advance_frame(), Ok(()));
    rig.surface.on_frame_committed();

    // Frame N+1: overlay-only. The render client's format is wrong for a
    // buffer the fixed-function hardware writes, so prepare_frame falls
    // back to the consumer-negotiated default and rebinds exactly once.
    assert_eq!(rig.surface.begin_frame(true), Ok(()));
    let before_prepare = rig.sink.dequeue_count();
    assert_eq!(rig.surface.prepare_frame(CompositionType::Overlay), Ok(()));
    assert_eq!(rig.sink.dequeue_count(), before_prepare + 1);

    let outputs = rig.composer.output_calls();
    let rebound = outputs.last().expect("rebound output");
    assert_eq!(
        rebound.1.as_ref().expect("buffer").format(),
        PixelFormat::ImplementationDefined
    );

    // Same type again: no further renegotiation.
    assert_eq!(rig.surface.prepare_frame(CompositionType::Overlay), Ok(()));
    assert_eq!(rig.sink.dequeue_count(), before_prepare + 1);
}

#[test]
fn unchanged_frame_is_cancelled_not_queued() {
    let rig = rig();
    let retire = Fence::new();
    rig.composer.set_retire_fence(retire.clone());

    assert_eq!(rig.surface.begin_frame(false), Ok(()));
    assert_eq!(rig.surface.prepare_frame(CompositionType::Overlay), Ok(()));
    assert_eq!(rig.surface.advance_frame(), Ok(()));
    rig.surface.on_frame_committed();

    // The consumer never saw a frame: the buffer went back via cancel so an
    // unchanged display cannot trigger an endless recomposition loop.
    assert_eq!(rig.sink.queued_count(), 0);
    let cancelled = rig.sink.cancelled();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].1, Some(retire));
}

#[test]
fn advance_without_buffer_bails_out() {
    let rig = rig();
    rig.sink.fail_dequeues.set(true);

    assert_eq!(rig.surface.begin_frame(true), Err(SurfaceError::NoMemory));
    assert_eq!(rig.surface.prepare_frame(CompositionType::Overlay), Ok(()));
    assert_eq!(rig.surface.advance_frame(), Err(SurfaceError::NoMemory));
    rig.surface.on_frame_committed();

    assert!(rig.composer.output_calls().is_empty());
    assert_eq!(rig.sink.queued_count(), 0);
}

#[test]
fn uncommitted_frame_buffer_is_reclaimed_by_next_frame() {
    let rig = rig();
    assert_eq!(rig.surface.begin_frame(true), Ok(()));
    let stale_fence = rig.sink.last_dequeue_fence();
    assert_eq!(rig.surface.prepare_frame(CompositionType::Overlay), Ok(()));
    assert_eq!(rig.surface.advance_frame(), Ok(()));
    // The driver loop skips on_frame_committed (the commit failed); the
    // bound buffer must not leak.

    assert_eq!(rig.surface.begin_frame(true), Ok(()));
    let cancelled = rig.sink.cancelled();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].1, stale_fence);
    assert_eq!(rig.sink.dequeue_count(), 2);
}

#[test]
fn forced_hardware_copy_turns_gpu_frames_mixed() {
    let rig = rig_with(
        SurfaceOptions {
            force_hardware_copy: true,
            ..Default::default()
        },
        Some(DisplayId(5)),
    );
    assert_eq!(rig.surface.begin_frame(true), Ok(()));
    assert_eq!(rig.surface.prepare_frame(CompositionType::Gpu), Ok(()));

    // The GPU render target now comes from the scratch pool, proving the
    // frame is treated as mixed.
    let dequeued = rig
        .surface
        .dequeue_buffer(
            true,
            sink_size(),
            PixelFormat::Rgba8888,
            BufferUsage::GPU_RENDER_TARGET,
        )
        .expect("render dequeue");
    assert!(dequeued.slot >= BUFFER_SLOT_COUNT - 2);
}

#[test]
fn connect_strips_sink_transform_hint() {
    let rig = rig();
    let output = rig.surface.connect(ProducerApi::Gpu).expect("connect");
    assert_eq!(output.transform_hint, TransformFlags::empty());
    assert_eq!(output.size, sink_size());
    assert_eq!(rig.surface.disconnect(ProducerApi::Gpu), Ok(()));
}

#[test]
fn query_answers_sink_dimensions() {
    let rig = rig();
    assert_eq!(rig.surface.query(SurfaceQuery::Width), Ok(1280));
    assert_eq!(rig.surface.query(SurfaceQuery::Height), Ok(720));
    assert_eq!(
        rig.surface.query(SurfaceQuery::Format),
        Ok(PixelFormat::Yv12.to_raw())
    );

    rig.surface.resize_buffers(Size2D::new(1920, 1080));
    assert_eq!(rig.surface.query(SurfaceQuery::Width), Ok(1920));
    assert_eq!(rig.surface.query(SurfaceQuery::Height), Ok(1080));
}

#[test]
fn slot_identity_operations_are_unsupported() {
    let rig = rig();
    assert_eq!(
        rig.surface.detach_buffer(0),
        Err(SurfaceError::InvalidOperation)
    );
    assert!(matches!(
        rig.surface.attach_buffer(display_traits::GraphicBuffer::allocate(
            sink_size(),
            PixelFormat::Rgba8888,
            BufferUsage::GPU_RENDER_TARGET,
        )),
        Err(SurfaceError::InvalidOperation)
    ));
    assert_eq!(
        rig.surface.set_sideband_stream(true),
        Err(SurfaceError::InvalidOperation)
    );
    assert_eq!(
        rig.surface.allow_allocation(true),
        Err(SurfaceError::InvalidOperation)
    );
}
