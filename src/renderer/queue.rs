use ash::vk;

#[derive(Debug, Clone, Copy)]
pub struct Queue {
    pub family_index: u32,
    pub handle: vk::Queue,
}

impl Queue {
    pub fn new(family_index: u32, handle: vk::Queue) -> Self {
        Self {
            family_index,
            handle,
        }
    }
}

/// Queue families the renderer needs. Graphics and present may be the same family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Picks the first graphics family, and for presentation prefers that same family.
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        supports_present: impl Fn(u32) -> bool,
    ) -> Self {
        let graphics = families
            .iter()
            .position(|family| {
                family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|i| i as u32);

        let present = match graphics {
            Some(index) if supports_present(index) => Some(index),
            _ => (0..families.len() as u32)
                .find(|&i| families[i as usize].queue_count > 0 && supports_present(i)),
        };

        Self { graphics, present }
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut indices = Vec::with_capacity(2);
        for index in [self.graphics, self.present].into_iter().flatten() {
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn shared_family_is_preferred() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let indices = QueueFamilyIndices::find(&families, |_| true);
        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(1));
        assert_eq!(indices.unique(), vec![1]);
    }

    #[test]
    fn separate_present_family() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
        ];
        let indices = QueueFamilyIndices::find(&families, |i| i == 1);
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(1));
        assert!(indices.is_complete());
        assert_eq!(indices.unique(), vec![0, 1]);
    }

    #[test]
    fn incomplete_without_graphics_or_present() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        let indices = QueueFamilyIndices::find(&families, |_| true);
        assert!(!indices.is_complete());

        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = QueueFamilyIndices::find(&families, |_| false);
        assert_eq!(indices.present, None);
        assert!(!indices.is_complete());
    }
}
