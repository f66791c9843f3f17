use crate::renderer::buffer;
use crate::renderer::command::CommandPool;
use crate::renderer::descriptor::DescriptorAshDevice;
use crate::renderer::instance::RenderInstance;
use crate::renderer::queue::{Queue, QueueFamilyIndices};
use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, eyre};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use gpu_descriptor::DescriptorAllocator;
use std::ffi::{CStr, c_char};
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex};

/// Devices of this type are always preferred over any amount of extra memory
pub const DISCRETE_GPU_BONUS: u64 = 100_000_000_000;

pub type SharedDescriptorAllocator =
    Arc<Mutex<DescriptorAllocator<vk::DescriptorPool, vk::DescriptorSet>>>;

/// Everything device selection needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub geometry_shader: bool,
    pub sampler_anisotropy: bool,
    pub extensions_supported: bool,
    /// At least one surface format and one present mode
    pub swapchain_adequate: bool,
    pub queue_families: QueueFamilyIndices,
    pub device_local_heap_bytes: u64,
}

impl DeviceCandidate {
    /// Zero means unusable. Discrete GPUs win first, then device-local memory breaks ties.
    pub fn score(&self) -> u64 {
        if !self.geometry_shader
            || !self.sampler_anisotropy
            || !self.extensions_supported
            || !self.swapchain_adequate
            || !self.queue_families.is_complete()
        {
            return 0;
        }

        let mut score = 1u64.saturating_add(self.device_local_heap_bytes);
        if self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score = score.saturating_add(DISCRETE_GPU_BONUS);
        }
        score
    }
}

/// Index of the highest-scoring candidate; the first one wins ties.
pub fn pick_best_candidate(candidates: &[DeviceCandidate]) -> Result<usize> {
    let (index, score) = candidates
        .iter()
        .map(DeviceCandidate::score)
        .enumerate()
        .fold(None, |best: Option<(usize, u64)>, (i, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((i, score)),
        })
        .ok_or_eyre("No Vulkan capable GPU found")?;

    if score == 0 {
        return Err(eyre!("Failed to find a suitable GPU"));
    }
    Ok(index)
}

/// The logical device, its queues and the device-wide allocators
pub struct RenderDevice {
    pub logical: Arc<ash::Device>,
    pub physical: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    pub graphics_queue: Queue,
    pub present_queue: Queue,

    memory_allocator: ManuallyDrop<Arc<Mutex<Allocator>>>,
    descriptor_allocator: SharedDescriptorAllocator,
    upload_commands: ManuallyDrop<Mutex<CommandPool>>,
}

impl RenderDevice {
    pub fn new(
        instance: &RenderInstance,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> Result<Self> {
        let (physical, queue_families) = Self::select_physical_device(
            &instance.instance,
            surface,
            surface_loader,
        )?;

        let (logical, graphics_queue, present_queue) = Self::create_logical_device(
            &instance.instance,
            physical,
            queue_families,
        )?;

        let (properties, memory_properties) = unsafe {
            (
                instance.instance.get_physical_device_properties(physical),
                instance.instance.get_physical_device_memory_properties(physical),
            )
        };

        let memory_allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: logical.clone(),
            physical_device: physical,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: log::log_enabled!(log::Level::Debug),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: log::log_enabled!(log::Level::Trace),
                log_frees: log::log_enabled!(log::Level::Trace),
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let logical = Arc::new(logical);

        let upload_commands = CommandPool::new(
            logical.clone(),
            graphics_queue.family_index,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )?;

        let descriptor_allocator: DescriptorAllocator<vk::DescriptorPool, vk::DescriptorSet> =
            DescriptorAllocator::new(0);

        Ok(Self {
            logical,
            physical,
            properties,
            memory_properties,

            graphics_queue,
            present_queue,

            memory_allocator: ManuallyDrop::new(Arc::new(Mutex::new(memory_allocator))),
            descriptor_allocator: Arc::new(Mutex::new(descriptor_allocator)),
            upload_commands: ManuallyDrop::new(Mutex::new(upload_commands)),
        })
    }

    pub fn memory_allocator(&self) -> Arc<Mutex<Allocator>> {
        Arc::clone(&self.memory_allocator)
    }

    pub fn descriptor_allocator(&self) -> SharedDescriptorAllocator {
        self.descriptor_allocator.clone()
    }

    pub fn find_memory_type(
        &self,
        type_filter: u32,
        required: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        buffer::find_memory_type(type_filter, required, &self.memory_properties)
    }

    pub fn max_sampler_anisotropy(&self) -> f32 {
        self.properties.limits.max_sampler_anisotropy
    }

    /// Executes `func` on the graphics queue right away and waits for the queue to drain.
    /// Meant for load-time transfers, never for per-frame work.
    pub fn immediate_submit<F>(&self, func: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer, &ash::Device) -> Result<()>,
    {
        self.upload_commands
            .lock()
            .map_err(|e| eyre!(e.to_string()))?
            .submit_one_shot(self.graphics_queue.handle, func)
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.logical.device_wait_idle()? };
        Ok(())
    }

    /// First format in `candidates` whose tiling supports all of `features`.
    pub fn find_supported_format(
        &self,
        instance: &ash::Instance,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> Result<vk::Format> {
        select_format(candidates, tiling, features, |format| unsafe {
            instance.get_physical_device_format_properties(self.physical, format)
        })
    }

    fn select_physical_device(
        instance: &ash::Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices()? };

        let candidates = devices
            .iter()
            .map(|&device| Self::describe_device(instance, device, surface, surface_loader))
            .collect::<Result<Vec<_>>>()?;

        for candidate in &candidates {
            log::info!(
                "GPU candidate '{}' ({:?}): score {}",
                candidate.name,
                candidate.device_type,
                candidate.score()
            );
        }

        let best = pick_best_candidate(&candidates)?;
        log::info!("Selected GPU '{}'", candidates[best].name);
        Ok((devices[best], candidates[best].queue_families))
    }

    fn describe_device(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> Result<DeviceCandidate> {
        let (props, features, memory, families) = unsafe {
            (
                instance.get_physical_device_properties(device),
                instance.get_physical_device_features(device),
                instance.get_physical_device_memory_properties(device),
                instance.get_physical_device_queue_family_properties(device),
            )
        };

        let name = props
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from("<unnamed>"));

        let queue_families = QueueFamilyIndices::find(&families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        });

        let extensions_supported = Self::supports_required_extensions(instance, device)?;

        // Only query the surface once the swapchain extension is known to exist
        let swapchain_adequate = extensions_supported && unsafe {
            let formats = surface_loader.get_physical_device_surface_formats(device, surface)?;
            let modes = surface_loader.get_physical_device_surface_present_modes(device, surface)?;
            !formats.is_empty() && !modes.is_empty()
        };

        let device_local_heap_bytes = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();

        Ok(DeviceCandidate {
            name,
            device_type: props.device_type,
            geometry_shader: features.geometry_shader == vk::TRUE,
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            extensions_supported,
            swapchain_adequate,
            queue_families,
            device_local_heap_bytes,
        })
    }

    fn supports_required_extensions(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
    ) -> Result<bool> {
        let supported = unsafe { instance.enumerate_device_extension_properties(device)? };
        let supported = supported
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .collect::<Vec<_>>();

        Ok(Self::get_required_device_extensions()
            .iter()
            .all(|req_ext| {
                let found = supported.contains(req_ext);
                if !found {
                    log::debug!("Device extension not supported: {:?}", req_ext);
                }
                found
            }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilyIndices,
    ) -> Result<(ash::Device, Queue, Queue)> {
        let graphics_index = queue_families
            .graphics
            .ok_or_eyre("Selected GPU has no graphics queue")?;
        let present_index = queue_families
            .present
            .ok_or_eyre("Selected GPU has no present queue")?;

        let queue_priorities = [1.0];
        let queue_create_infos = queue_families
            .unique()
            .into_iter()
            .map(|index| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(index)
                    .queue_priorities(&queue_priorities)
            })
            .collect::<Vec<_>>();

        let enabled_extension_names = Self::get_required_device_extensions()
            .iter()
            .map(|ext| ext.as_ptr())
            .collect::<Vec<*const c_char>>();
        let enabled_features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(true)
            .geometry_shader(true);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&enabled_extension_names)
            .enabled_features(&enabled_features);

        let device = unsafe {
            instance.create_device(physical_device, &device_create_info, None)?
        };

        let (graphics_queue, present_queue) = unsafe {
            (
                Queue::new(graphics_index, device.get_device_queue(graphics_index, 0)),
                Queue::new(present_index, device.get_device_queue(present_index, 0)),
            )
        };

        Ok((device, graphics_queue, present_queue))
    }

    fn get_required_device_extensions() -> Vec<&'static CStr> {
        vec![
            ash::khr::swapchain::NAME,

            #[cfg(target_os = "macos")]
            ash::khr::portability_subset::NAME,
        ]
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.logical.device_wait_idle() {
                log::error!("device_wait_idle failed during shutdown: {e}");
            }

            ManuallyDrop::drop(&mut self.upload_commands);

            match self.descriptor_allocator.lock() {
                Ok(mut allocator) => {
                    allocator.cleanup(&DescriptorAshDevice::from(self.logical.clone()));
                }
                Err(e) => log::error!("Descriptor allocator poisoned: {e}"),
            }

            // Reports leaked allocations, so it has to go before the device
            ManuallyDrop::drop(&mut self.memory_allocator);

            self.logical.destroy_device(None);
        }
    }
}

pub fn select_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    format_properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Result<vk::Format> {
    candidates
        .iter()
        .copied()
        .find(|&format| {
            let props = format_properties(format);
            match tiling {
                vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                _ => false,
            }
        })
        .ok_or_eyre(format!("None of {:?} supports {:?} with {:?} tiling", candidates, features, tiling))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suitable(name: &str, device_type: vk::PhysicalDeviceType, heap: u64) -> DeviceCandidate {
        DeviceCandidate {
            name: name.to_string(),
            device_type,
            geometry_shader: true,
            sampler_anisotropy: true,
            extensions_supported: true,
            swapchain_adequate: true,
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: Some(0),
            },
            device_local_heap_bytes: heap,
        }
    }

    const GIB: u64 = 1 << 30;

    #[test]
    fn missing_requirements_score_zero() {
        let base = suitable("gpu", vk::PhysicalDeviceType::DISCRETE_GPU, 8 * GIB);

        let mut c = base.clone();
        c.geometry_shader = false;
        assert_eq!(c.score(), 0);

        let mut c = base.clone();
        c.sampler_anisotropy = false;
        assert_eq!(c.score(), 0);

        let mut c = base.clone();
        c.extensions_supported = false;
        assert_eq!(c.score(), 0);

        let mut c = base.clone();
        c.queue_families.present = None;
        assert_eq!(c.score(), 0);

        let mut c = base;
        c.swapchain_adequate = false;
        assert_eq!(c.score(), 0);
    }

    #[test]
    fn discrete_beats_integrated_with_more_memory() {
        let integrated = suitable("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 64 * GIB);
        let discrete = suitable("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, 2 * GIB);
        assert!(discrete.score() > integrated.score());
        assert_eq!(pick_best_candidate(&[integrated, discrete]).unwrap(), 1);
    }

    #[test]
    fn heap_size_breaks_ties() {
        let small = suitable("small", vk::PhysicalDeviceType::DISCRETE_GPU, 4 * GIB);
        let big = suitable("big", vk::PhysicalDeviceType::DISCRETE_GPU, 12 * GIB);
        assert_eq!(pick_best_candidate(&[small, big]).unwrap(), 1);
    }

    #[test]
    fn equal_scores_keep_first() {
        let a = suitable("a", vk::PhysicalDeviceType::INTEGRATED_GPU, GIB);
        let b = suitable("b", vk::PhysicalDeviceType::INTEGRATED_GPU, GIB);
        assert_eq!(pick_best_candidate(&[a, b]).unwrap(), 0);
    }

    #[test]
    fn no_qualifying_device_is_an_error() {
        assert!(pick_best_candidate(&[]).is_err());

        let mut cpu = suitable("llvmpipe", vk::PhysicalDeviceType::CPU, 0);
        cpu.geometry_shader = false;
        assert!(pick_best_candidate(&[cpu]).is_err());
    }

    #[test]
    fn qualifying_device_without_device_local_heap_still_scores() {
        let c = suitable("cpu", vk::PhysicalDeviceType::CPU, 0);
        assert!(c.score() > 0);
    }

    #[test]
    fn format_selection_respects_order_and_tiling() {
        let depth = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        let props = |format: vk::Format| match format {
            vk::Format::D32_SFLOAT => vk::FormatProperties {
                linear_tiling_features: depth,
                ..Default::default()
            },
            vk::Format::D24_UNORM_S8_UINT => vk::FormatProperties {
                optimal_tiling_features: depth,
                ..Default::default()
            },
            _ => vk::FormatProperties::default(),
        };
        let candidates = [
            vk::Format::D32_SFLOAT,
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D24_UNORM_S8_UINT,
        ];

        assert_eq!(
            select_format(&candidates, vk::ImageTiling::OPTIMAL, depth, props).unwrap(),
            vk::Format::D24_UNORM_S8_UINT
        );
        assert_eq!(
            select_format(&candidates, vk::ImageTiling::LINEAR, depth, props).unwrap(),
            vk::Format::D32_SFLOAT
        );
        assert!(select_format(&candidates[..2], vk::ImageTiling::OPTIMAL, depth, props).is_err());
    }
}
