//! Command buffer lifecycle
//!
//! A command buffer moves through
//! `Initial -> Recording -> Executable -> Pending -> Initial`; resetting its
//! pool sends it to `Invalid`, from which only deallocation is possible.
//! Backends keep one [`CommandBufferTracking`] per buffer and route every
//! lifecycle call and every recorded command through it.

use super::error::{DriverError, DriverResult};
use super::handles::{CommandPoolId, CommandQueueId, FenceId};

/// Level of command buffers a pool hands out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommandBufferType {
    /// Submitted directly to queues
    #[default]
    Primary,
    /// Executed from primary buffers
    Secondary,
}

/// Lifecycle state of a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    /// Freshly allocated or reset, nothing recorded
    Initial,
    /// Between `begin` and `end`
    Recording,
    /// Recorded and submittable
    Executable,
    /// Submitted and not yet waited on
    Pending,
    /// Owning pool was reset, only deallocation is allowed
    Invalid,
}

impl CommandBufferState {
    fn transition(
        &mut self,
        operation: &'static str,
        from: &[Self],
        to: Self,
    ) -> DriverResult<()> {
        if from.contains(self) {
            *self = to;
            Ok(())
        } else {
            Err(DriverError::InvalidCommandBufferState {
                operation,
                state: *self,
            })
        }
    }

    /// `Initial -> Recording`
    pub fn begin(&mut self) -> DriverResult<()> {
        self.transition("begin", &[Self::Initial], Self::Recording)
    }

    /// `Recording -> Executable`
    pub fn end(&mut self) -> DriverResult<()> {
        self.transition("end", &[Self::Recording], Self::Executable)
    }

    /// `Executable -> Pending`
    pub fn submit(&mut self) -> DriverResult<()> {
        self.transition("submit", &[Self::Executable], Self::Pending)
    }

    /// `Pending -> Initial` once the device finished the work
    pub fn complete(&mut self) {
        if *self == Self::Pending {
            *self = Self::Initial;
        }
    }

    /// Forced return to `Initial` from anything but `Invalid`
    pub fn reset(&mut self) -> DriverResult<()> {
        self.transition(
            "reset",
            &[Self::Initial, Self::Recording, Self::Executable, Self::Pending],
            Self::Initial,
        )
    }

    /// Pool reset
    pub fn invalidate(&mut self) {
        *self = Self::Invalid;
    }

    /// Reject commands recorded outside `Recording`
    pub fn ensure_recording(self, operation: &'static str) -> DriverResult<()> {
        if self == Self::Recording {
            Ok(())
        } else {
            Err(DriverError::InvalidCommandBufferState {
                operation,
                state: self,
            })
        }
    }
}

/// Per-buffer bookkeeping shared by the backends
#[derive(Debug, Clone)]
pub struct CommandBufferTracking {
    /// Current lifecycle state
    pub state: CommandBufferState,
    /// Owning pool
    pub pool: CommandPoolId,
    /// Buffer level
    pub kind: CommandBufferType,
    /// Queue of the last submission
    pub submitted_to: Option<CommandQueueId>,
    /// Fence signalled by the last submission
    pub fence: Option<FenceId>,
    label_depth: u32,
}

impl CommandBufferTracking {
    /// Tracking for a buffer freshly allocated from `pool`
    pub const fn new(pool: CommandPoolId, kind: CommandBufferType) -> Self {
        Self {
            state: CommandBufferState::Initial,
            pool,
            kind,
            submitted_to: None,
            fence: None,
            label_depth: 0,
        }
    }

    /// Start recording
    pub fn begin(&mut self) -> DriverResult<()> {
        self.state.begin()?;
        self.label_depth = 0;
        Ok(())
    }

    /// Finish recording; every label must be closed
    pub fn end(&mut self) -> DriverResult<()> {
        self.state.ensure_recording("end")?;
        if self.label_depth != 0 {
            return Err(DriverError::contract(format!(
                "command buffer ended with {} open debug label(s)",
                self.label_depth
            )));
        }
        self.state.end()
    }

    /// Mark submitted to `queue`
    pub fn submit(&mut self, queue: CommandQueueId, fence: Option<FenceId>) -> DriverResult<()> {
        if self.kind == CommandBufferType::Secondary {
            return Err(DriverError::contract(
                "secondary command buffers cannot be submitted to a queue",
            ));
        }
        self.state.submit()?;
        self.submitted_to = Some(queue);
        self.fence = fence;
        Ok(())
    }

    /// Mark the submitted work finished
    pub fn complete(&mut self) {
        self.state.complete();
        if self.state == CommandBufferState::Initial {
            self.fence = None;
        }
    }

    /// Forced reset
    pub fn reset(&mut self) -> DriverResult<()> {
        self.state.reset()?;
        self.label_depth = 0;
        self.fence = None;
        Ok(())
    }

    /// Check a command may be recorded
    pub fn record(&self, operation: &'static str) -> DriverResult<()> {
        self.state.ensure_recording(operation)
    }

    /// Open a debug label
    pub fn begin_label(&mut self) -> DriverResult<()> {
        self.record("begin label in")?;
        self.label_depth += 1;
        Ok(())
    }

    /// Close the innermost debug label
    pub fn end_label(&mut self) -> DriverResult<()> {
        self.record("end label in")?;
        if self.label_depth == 0 {
            return Err(DriverError::contract("debug label end without matching begin"));
        }
        self.label_depth -= 1;
        Ok(())
    }
}
