//! In-order command recording for host queues

use super::memory::MemoryManager;
use super::routines::{execute, HostRoutine};
use crate::driver::{ArgValue, BufferHandle, ReadSlot};
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::Arc;

/// A recorded, not yet executed command
pub(crate) enum Command {
    Write {
        buffer: BufferHandle,
        offset: usize,
        data: Arc<[u8]>,
    },
    Read {
        buffer: BufferHandle,
        offset: usize,
        slot: Arc<ReadSlot>,
    },
    Launch {
        kernel: String,
        routine: HostRoutine,
        /// Arguments as bound at enqueue time
        args: Vec<ArgValue>,
        global: Vec<usize>,
    },
}

/// Strictly in-order queue; commands run when the queue is flushed
#[derive(Default)]
pub(crate) struct HostQueue {
    pending: VecDeque<Command>,
}

impl HostQueue {
    pub fn push(&mut self, command: Command) {
        self.pending.push_back(command);
    }

    /// Whether a recorded command still touches `buffer`
    pub fn references(&self, buffer: BufferHandle) -> bool {
        self.pending.iter().any(|command| match command {
            Command::Write { buffer: b, .. } | Command::Read { buffer: b, .. } => *b == buffer,
            Command::Launch { args, .. } => args.iter().any(|arg| matches!(arg, ArgValue::Buffer(b) if *b == buffer)),
        })
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Execute every pending command in submission order.
    ///
    /// Stops at the first failing command; commands after it are discarded
    /// because the in-order contract no longer holds.
    pub fn flush(&mut self, memory: &mut MemoryManager) -> Result<()> {
        while let Some(command) = self.pending.pop_front() {
            let outcome = match command {
                Command::Write { buffer, offset, data } => memory.copy_to_buffer(buffer, offset, &data),
                Command::Read { buffer, offset, slot } => {
                    let mut bytes = vec![0u8; slot.len()];
                    memory.copy_from_buffer(buffer, offset, &mut bytes).map(|()| {
                        slot.complete_with(&bytes);
                    })
                }
                Command::Launch {
                    kernel,
                    routine,
                    args,
                    global,
                } => execute(&kernel, &routine, &args, &global, memory),
            };
            if let Err(err) = outcome {
                self.pending.clear();
                return Err(err);
            }
        }
        Ok(())
    }
}
