use crate::renderer::registry::{Handle, Registry};
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, eyre};
use std::sync::Arc;

/// Host-side view of a command buffer's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Initial,
    Recording,
    Executable,
}

impl RecordingState {
    pub fn begin(self) -> Result<Self> {
        match self {
            Self::Initial => Ok(Self::Recording),
            other => Err(eyre!("Cannot begin recording a command buffer in the {:?} state", other)),
        }
    }

    pub fn end(self) -> Result<Self> {
        match self {
            Self::Recording => Ok(Self::Executable),
            other => Err(eyre!("Cannot end a command buffer in the {:?} state", other)),
        }
    }

    pub fn submit(self) -> Result<Self> {
        match self {
            Self::Executable => Ok(Self::Executable),
            other => Err(eyre!("Cannot submit a command buffer in the {:?} state", other)),
        }
    }

    /// Resetting is legal from every state, including mid-recording.
    pub fn reset(self) -> Self {
        Self::Initial
    }
}

pub struct CommandSlot {
    handle: vk::CommandBuffer,
    state: RecordingState,
}

pub type CommandBufferId = Handle<CommandSlot>;

/// Owns a `vk::CommandPool` together with every command buffer allocated from it.
/// Buffers are addressed by [`CommandBufferId`] and are freed with the pool at the latest.
pub struct CommandPool {
    pool: vk::CommandPool,
    buffers: Registry<CommandSlot>,
    device: Arc<ash::Device>,
}

impl CommandPool {
    pub fn new(
        device: Arc<ash::Device>,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            // Allow the pool to reset individual command buffers
            .flags(flags | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.create_command_pool(&pool_info, None)? };

        Ok(Self {
            pool,
            buffers: Registry::new(),
            device,
        })
    }

    pub fn allocate(&mut self) -> Result<CommandBufferId> {
        let command_buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .command_buffer_count(1)
            .level(vk::CommandBufferLevel::PRIMARY);
        let handle = unsafe {
            self.device
                .allocate_command_buffers(&command_buffer_info)?
                .into_iter()
                .next()
                .ok_or_eyre("Driver returned no command buffer")?
        };

        Ok(self.buffers.insert(CommandSlot {
            handle,
            state: RecordingState::Initial,
        }))
    }

    pub fn free(&mut self, id: CommandBufferId) -> Result<()> {
        let slot = self
            .buffers
            .remove(id)
            .ok_or_eyre(format!("Unknown command buffer {:?}", id))?;
        unsafe {
            self.device.free_command_buffers(self.pool, &[slot.handle]);
        }
        Ok(())
    }

    pub fn begin(
        &mut self,
        id: CommandBufferId,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<vk::CommandBuffer> {
        let device = self.device.clone();
        let slot = self.slot_mut(id)?;
        let next = slot.state.begin()?;

        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe {
            device.begin_command_buffer(slot.handle, &begin_info)?;
        }

        slot.state = next;
        Ok(slot.handle)
    }

    pub fn end(&mut self, id: CommandBufferId) -> Result<()> {
        let device = self.device.clone();
        let slot = self.slot_mut(id)?;
        let next = slot.state.end()?;

        unsafe {
            device.end_command_buffer(slot.handle)?;
        }

        slot.state = next;
        Ok(())
    }

    pub fn reset(&mut self, id: CommandBufferId) -> Result<()> {
        let device = self.device.clone();
        let slot = self.slot_mut(id)?;

        unsafe {
            device.reset_command_buffer(slot.handle, vk::CommandBufferResetFlags::empty())?;
        }

        slot.state = slot.state.reset();
        Ok(())
    }

    /// Checks that `id` is ready to be handed to `vkQueueSubmit` and returns its handle.
    pub fn prepare_submit(&mut self, id: CommandBufferId) -> Result<vk::CommandBuffer> {
        let slot = self.slot_mut(id)?;
        slot.state = slot.state.submit()?;
        Ok(slot.handle)
    }

    /// Records `func` into a transient command buffer, submits it and blocks until `queue` is idle.
    pub fn submit_one_shot<F>(&mut self, queue: vk::Queue, func: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer, &ash::Device) -> Result<()>,
    {
        let id = self.allocate()?;
        let result = self.record_and_wait(id, queue, func);
        // Free even when recording failed so the arena does not grow
        self.free(id)?;
        result
    }

    fn record_and_wait<F>(&mut self, id: CommandBufferId, queue: vk::Queue, func: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer, &ash::Device) -> Result<()>,
    {
        // This command buffer will be used exactly once before being freed
        let cmd = self.begin(id, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        func(cmd, &self.device)?;
        self.end(id)?;

        let cmd = [self.prepare_submit(id)?];
        let submit = vk::SubmitInfo::default().command_buffers(&cmd);
        unsafe {
            self.device.queue_submit(queue, &[submit], vk::Fence::null())?;
            self.device.queue_wait_idle(queue)?;
        }

        Ok(())
    }

    fn slot_mut(&mut self, id: CommandBufferId) -> Result<&mut CommandSlot> {
        self.buffers
            .get_mut(id)
            .ok_or_eyre(format!("Unknown command buffer {:?}", id))
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        let handles = self
            .buffers
            .iter()
            .map(|(_, slot)| slot.handle)
            .collect::<Vec<_>>();

        unsafe {
            if !handles.is_empty() {
                self.device.free_command_buffers(self.pool, &handles);
            }
            self.device.destroy_command_pool(self.pool, None);
        }
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::RecordingState::*;

    #[test]
    fn full_cycle() {
        let state = Initial.begin().unwrap();
        assert_eq!(state, Recording);
        let state = state.end().unwrap();
        assert_eq!(state, Executable);
        assert_eq!(state.submit().unwrap(), Executable);
        assert_eq!(state.reset(), Initial);
    }

    #[test]
    fn begin_twice_is_rejected() {
        assert!(Recording.begin().is_err());
        assert!(Executable.begin().is_err());
    }

    #[test]
    fn end_without_begin_is_rejected() {
        assert!(Initial.end().is_err());
        assert!(Executable.end().is_err());
    }

    #[test]
    fn submit_requires_finished_recording() {
        assert!(Initial.submit().is_err());
        assert!(Recording.submit().is_err());
    }

    #[test]
    fn reset_from_any_state() {
        for state in [Initial, Recording, Executable] {
            assert_eq!(state.reset(), Initial);
        }
    }
}
