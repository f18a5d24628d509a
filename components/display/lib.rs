/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The display subsystem: per-display devices and the virtual-display
//! buffer-routing core that connects a GPU render path and the
//! fixed-function composer to an external consumer.
//!
//! The interesting machinery is [`VirtualDisplaySurface`], which multiplexes
//! two buffer sources onto one producer interface and walks a strict
//! per-refresh protocol; [`DisplayDevice`] wraps it with projection math and
//! the device-level state the rest of the compositor reads.

#![deny(unsafe_code)]

mod device;
mod frame;
mod scratch;
mod slots;
mod transform;
mod virtual_surface;

pub use crate::device::{DisplayDevice, DisplayError, DisplayKind, PowerMode};
pub use crate::scratch::{DEFAULT_SCRATCH_DEPTH, ScratchPool};
pub use crate::slots::{BUFFER_SLOT_COUNT, Source, fb_source_for, map_slot};
pub use crate::transform::Transform;
pub use crate::virtual_surface::{SurfaceOptions, VirtualDisplaySurface};
