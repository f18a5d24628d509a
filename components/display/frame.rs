/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Per-frame protocol state. The driver loop walks each refresh through
//! `begin -> prepare -> [render] -> submit -> commit`; the tracker records
//! where in that walk the surface believes it is, and the context carries
//! everything that belongs to exactly one frame.
//!
//! Ordering violations are diagnosed, not enforced: some driver sequences
//! legitimately skip states (an overlay-only frame never enters the render
//! states), and a frame abandoned after a failed submit leaves its context
//! in place on purpose so the next frame can reclaim the bound buffer.

use display_traits::{CompositionType, Fence};
use log::warn;

/// Where in the per-refresh walk the surface currently is.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FrameState {
    #[default]
    Idle,
    Begun,
    Prepared,
    /// A render client has dequeued the frame's target buffer.
    Rendering,
    /// The render client queued its result; the frame is ready to submit.
    Rendered,
    /// The frame has been pushed to the composer and awaits commit.
    Submitted,
}

impl FrameState {
    pub fn name(self) -> &'static str {
        match self {
            FrameState::Idle => "IDLE",
            FrameState::Begun => "BEGUN",
            FrameState::Prepared => "PREPARED",
            FrameState::Rendering => "RENDERING",
            FrameState::Rendered => "RENDERED",
            FrameState::Submitted => "SUBMITTED",
        }
    }
}

/// A producer slot paired with the fence gating access to its buffer.
#[derive(Clone, Debug)]
pub struct BufferBinding {
    pub pslot: usize,
    pub fence: Option<Fence>,
}

/// Everything owned by a single frame: created at `begin_frame`, consumed at
/// `on_frame_committed`. `output` is the sink-dequeued buffer the consumer
/// will receive; `fb` is the GPU-rendered buffer the fixed-function path
/// reads on mixed frames (and aliases `output` on pure-GPU frames).
#[derive(Debug, Default)]
pub struct FrameContext {
    pub must_recompose: bool,
    pub composition: CompositionType,
    pub fb: Option<BufferBinding>,
    pub output: Option<BufferBinding>,
}

/// The state/context pair owned by a virtual display surface.
#[derive(Debug, Default)]
pub struct FrameTracker {
    pub state: FrameState,
    pub frame: Option<FrameContext>,
}

impl FrameTracker {
    /// Diagnose a call arriving outside its expected predecessor states.
    /// Best-effort only; execution continues regardless.
    pub fn expect(&self, name: &str, operation: &str, expected: &[FrameState]) {
        if !expected.contains(&self.state) {
            warn!(
                "[{}] unexpected {}() in {} state",
                name,
                operation,
                self.state.name()
            );
        }
    }
}
