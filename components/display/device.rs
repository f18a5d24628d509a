/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! One output of the compositor: a physical screen or a virtual display.
//! Owns the projection from logical viewport space onto the display's pixel
//! grid, the power/config bookkeeping the scheduler reads, and the glue that
//! drives the display surface through its per-refresh protocol.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use display_traits::{
    CompositionType, DeviceIntBox, DeviceIntSize, DisplayId, DisplaySurface, HardwareComposer,
    Orientation, PixelFormat, RenderTarget, SurfaceError, SurfaceResult, TransformFlags,
};
use euclid::Size2D;
use log::{error, trace};

use crate::transform::Transform;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisplayKind {
    Primary,
    External,
    Virtual,
}

impl DisplayKind {
    pub fn is_virtual(self) -> bool {
        self == DisplayKind::Virtual
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PowerMode {
    #[default]
    Off,
    Doze,
    On,
}

/// Failures surfaced by the device layer to its caller, which owns the
/// abort-versus-retry policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisplayError {
    Surface(SurfaceError),
    /// The render target granted a different size than requested. This is a
    /// driver contract breach; the device's state reflects the granted size.
    SizeMismatch {
        requested: DeviceIntSize,
        granted: DeviceIntSize,
    },
}

impl fmt::Display for DisplayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DisplayError::Surface(error) => write!(f, "surface error: {error}"),
            DisplayError::SizeMismatch { requested, granted } => write!(
                f,
                "render target granted {}x{} instead of {}x{}",
                granted.width, granted.height, requested.width, requested.height
            ),
        }
    }
}

impl std::error::Error for DisplayError {}

impl From<SurfaceError> for DisplayError {
    fn from(error: SurfaceError) -> DisplayError {
        DisplayError::Surface(error)
    }
}

#[derive(Clone, Debug)]
struct Projection {
    orientation: Orientation,
    /// What the caller asked for; `None` means "whole display". Kept so the
    /// projection can be re-derived in full when the display size changes.
    requested_viewport: Option<DeviceIntBox>,
    requested_frame: Option<DeviceIntBox>,
    /// The resolved rectangles the current transform was derived from.
    viewport: DeviceIntBox,
    frame: DeviceIntBox,
    global_transform: Transform,
    scissor: DeviceIntBox,
    needs_filtering: bool,
}

impl Default for Projection {
    fn default() -> Self {
        Projection {
            orientation: Orientation::Rot0,
            requested_viewport: None,
            requested_frame: None,
            viewport: DeviceIntBox::zero(),
            frame: DeviceIntBox::zero(),
            global_transform: Transform::identity(),
            scissor: DeviceIntBox::zero(),
            needs_filtering: false,
        }
    }
}

pub struct DisplayDevice {
    name: String,
    kind: DisplayKind,
    /// This display's identity at the hardware composer, if it has one.
    display: Option<DisplayId>,
    surface: Rc<dyn DisplaySurface>,
    target: Rc<dyn RenderTarget>,
    format: PixelFormat,
    size: Cell<DeviceIntSize>,
    page_flips: Cell<u32>,
    layer_stack: Cell<Option<u32>>,
    dirty: Cell<DeviceIntBox>,
    projection: RefCell<Projection>,
    power: Cell<PowerMode>,
    active_config: Cell<usize>,
}

impl DisplayDevice {
    pub fn new(
        name: &str,
        kind: DisplayKind,
        display: Option<DisplayId>,
        surface: Rc<dyn DisplaySurface>,
        target: Rc<dyn RenderTarget>,
        format: PixelFormat,
    ) -> DisplayDevice {
        let size = target.size();
        if kind.is_virtual() {
            // Never let a slow virtual-display consumer stall composition:
            // the swap must not wait for a free buffer.
            target.set_swap_interval(0);
        }
        let device = DisplayDevice {
            name: name.to_owned(),
            kind,
            display,
            surface,
            target,
            format,
            size: Cell::new(size),
            page_flips: Cell::new(0),
            layer_stack: Cell::new(None),
            dirty: Cell::new(DeviceIntBox::zero()),
            projection: RefCell::new(Projection::default()),
            // Virtual displays are always considered enabled.
            power: Cell::new(if kind.is_virtual() {
                PowerMode::On
            } else {
                PowerMode::Off
            }),
            active_config: Cell::new(0),
        };
        device.set_projection(Orientation::Rot0, None, None);
        device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DisplayKind {
        self.kind
    }

    pub fn size(&self) -> DeviceIntSize {
        self.size.get()
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn bounds(&self) -> DeviceIntBox {
        DeviceIntBox::from_size(self.size.get())
    }

    pub fn page_flip_count(&self) -> u32 {
        self.page_flips.get()
    }

    /// Record that this display presented a new frame.
    pub fn flip(&self) {
        self.page_flips.set(self.page_flips.get() + 1);
    }

    // Frame driving: forwards to the display surface, wrapped with the
    // render-target decisions that belong at the device level.

    pub fn begin_frame(&self, must_recompose: bool) -> SurfaceResult<()> {
        self.surface.begin_frame(must_recompose)
    }

    /// Derive the frame's composition type from what the composer assigned
    /// and tell the surface. A frame with no work at all (screen turning
    /// off) is treated as an overlay frame: no GPU pass, but the composer
    /// still runs its prepare/commit cycle.
    pub fn prepare_frame(&self, composer: &dyn HardwareComposer) -> SurfaceResult<()> {
        let (gpu, overlay) = match self.display {
            Some(id) => (
                composer.has_gpu_composition(id),
                composer.has_overlay_composition(id),
            ),
            None => (true, false),
        };
        let composition = match (gpu, overlay) {
            (true, true) => CompositionType::Mixed,
            (true, false) => CompositionType::Gpu,
            (false, _) => CompositionType::Overlay,
        };
        self.surface.prepare_frame(composition)
    }

    pub fn composition_complete(&self) -> SurfaceResult<()> {
        self.surface.composition_complete()
    }

    /// Swap the render target if the GPU composed anything this frame, then
    /// push the frame to the composer.
    pub fn swap_buffers(&self, composer: &dyn HardwareComposer) -> SurfaceResult<()> {
        let gpu_composed = self
            .display
            .is_none_or(|id| composer.has_gpu_composition(id));
        if gpu_composed {
            if let Err(swap_error) = self.target.swap_buffers() {
                error!("[{}] swap_buffers failed: {}", self.name, swap_error);
                return Err(swap_error);
            }
        }
        if let Err(error) = self.surface.advance_frame() {
            error!("[{}] failed pushing new frame to composer: {}", self.name, error);
            return Err(error);
        }
        Ok(())
    }

    pub fn on_swap_buffers_completed(&self) {
        self.surface.on_frame_committed();
    }

    pub fn make_current(&self) -> SurfaceResult<()> {
        self.target.make_current()?;
        if self.kind.is_virtual() {
            // Some drivers reset the swap interval on make-current; pin it
            // back down so the stall protection from construction holds.
            self.target.set_swap_interval(0);
        }
        Ok(())
    }

    // Projection.

    /// Derive the global transform taking the logical viewport onto the
    /// physical frame rectangle. Both rectangles default to the full display
    /// when unset, the viewport in logical (post-rotation) space. Any call
    /// invalidates all prior damage tracking, so the whole display is marked
    /// dirty.
    pub fn set_projection(
        &self,
        orientation: Orientation,
        viewport: Option<DeviceIntBox>,
        frame: Option<DeviceIntBox>,
    ) {
        let size = self.size.get();
        let (width, height) = (size.width as f32, size.height as f32);

        let rotation = Transform::rotation(orientation.flags(), width, height);

        // Viewport and frame are both specified in the logical orientation
        // of the display, so the full-display defaults swap their extents
        // for a quarter turn.
        let logical_bounds = DeviceIntBox::from_size(if orientation.is_quarter_turn() {
            Size2D::new(size.height, size.width)
        } else {
            size
        });

        let frame_rect = frame.filter(|rect| !rect.is_empty()).unwrap_or(logical_bounds);
        let viewport_rect = viewport
            .filter(|rect| !rect.is_empty())
            .unwrap_or(logical_bounds);

        self.dirty.set(self.bounds());

        let src_width = viewport_rect.width() as f32;
        let src_height = viewport_rect.height() as f32;
        let dst_width = frame_rect.width() as f32;
        let dst_height = frame_rect.height() as f32;
        let scale = if src_width != dst_width || src_height != dst_height {
            Transform::scale(dst_width / src_width, dst_height / src_height)
        } else {
            Transform::identity()
        };

        let to_origin =
            Transform::translation(-(viewport_rect.min.x as f32), -(viewport_rect.min.y as f32));
        let to_frame = Transform::translation(frame_rect.min.x as f32, frame_rect.min.y as f32);

        // Both rectangles live in logical space: move the viewport to the
        // origin, scale it onto the frame, move it into place, and only then
        // rotate out into the physical orientation.
        let global_transform = rotation * to_frame * scale * to_origin;

        let needs_filtering = !global_transform.preserves_rects() || global_transform.has_scale();

        let mut scissor = global_transform.transform_box(viewport_rect);
        if scissor.is_empty() {
            scissor = self.bounds();
        }

        trace!(
            "[{}] set_projection: orientation={:?} viewport={:?} frame={:?}",
            self.name,
            orientation,
            viewport_rect,
            frame_rect
        );

        *self.projection.borrow_mut() = Projection {
            orientation,
            requested_viewport: viewport,
            requested_frame: frame,
            viewport: viewport_rect,
            frame: frame_rect,
            global_transform,
            scissor,
            needs_filtering,
        };
    }

    /// Recreate the render target at a new size. The granted size becomes
    /// the device's size either way; a mismatch is reported to the caller
    /// instead of being treated as unrecoverable here. The projection is
    /// re-derived so the global transform never describes a stale size.
    pub fn set_display_size(&self, size: DeviceIntSize) -> Result<(), DisplayError> {
        self.dirty.set(self.bounds());

        self.surface.resize_buffers(size);
        let granted = self.target.resize(size)?;
        self.size.set(granted);

        let (orientation, viewport, frame) = {
            let projection = self.projection.borrow();
            (
                projection.orientation,
                projection.requested_viewport,
                projection.requested_frame,
            )
        };
        self.set_projection(orientation, viewport, frame);

        if granted != size {
            return Err(DisplayError::SizeMismatch {
                requested: size,
                granted,
            });
        }
        Ok(())
    }

    pub fn orientation(&self) -> Orientation {
        self.projection.borrow().orientation
    }

    pub fn orientation_transform(&self) -> TransformFlags {
        self.projection.borrow().orientation.flags()
    }

    pub fn global_transform(&self) -> Transform {
        self.projection.borrow().global_transform
    }

    pub fn viewport(&self) -> DeviceIntBox {
        self.projection.borrow().viewport
    }

    pub fn frame(&self) -> DeviceIntBox {
        self.projection.borrow().frame
    }

    pub fn scissor(&self) -> DeviceIntBox {
        self.projection.borrow().scissor
    }

    pub fn needs_filtering(&self) -> bool {
        self.projection.borrow().needs_filtering
    }

    // Damage tracking.

    pub fn dirty_rect(&self, repaint_everything: bool) -> DeviceIntBox {
        if repaint_everything {
            self.bounds()
        } else {
            self.dirty
                .get()
                .intersection(&self.bounds())
                .unwrap_or_else(DeviceIntBox::zero)
        }
    }

    pub fn clear_dirty(&self) {
        self.dirty.set(DeviceIntBox::zero());
    }

    // Scheduler-facing state.

    pub fn set_power_mode(&self, mode: PowerMode) {
        self.power.set(mode);
    }

    pub fn power_mode(&self) -> PowerMode {
        self.power.get()
    }

    pub fn is_display_on(&self) -> bool {
        self.power.get() != PowerMode::Off
    }

    pub fn set_active_config(&self, config: usize) {
        self.active_config.set(config);
    }

    pub fn active_config(&self) -> usize {
        self.active_config.get()
    }

    pub fn set_layer_stack(&self, stack: u32) {
        self.layer_stack.set(Some(stack));
        self.dirty.set(self.bounds());
    }

    pub fn layer_stack(&self) -> Option<u32> {
        self.layer_stack.get()
    }
}

impl fmt::Debug for DisplayDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let projection = self.projection.borrow();
        let size = self.size.get();
        write!(
            f,
            "DisplayDevice {{ {}: {:?} {}x{}, orientation={:?}, flips={}, power={:?}, \
             config={}, v={:?}, f={:?}, s={:?}, {:?} }}",
            self.name,
            self.kind,
            size.width,
            size.height,
            projection.orientation,
            self.page_flips.get(),
            self.power.get(),
            self.active_config.get(),
            projection.viewport,
            projection.frame,
            projection.scissor,
            projection.global_transform,
        )
    }
}
