//! Process-wide registry of device allocator factories.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::debug;

use crate::error::RuntimeError;

use super::{Allocator, AllocatorInfo, AllocatorPtr, Arena, ArenaConfig, CpuAllocator, CPU};

/// How to build the device allocator for one memory location name.
#[derive(Clone, Copy)]
pub struct DeviceAllocatorRegistrationInfo {
    pub factory: fn(device_id: u32) -> Box<dyn Allocator>,
    /// Byte ceiling applied to the arena wrapped around this device.
    pub max_mem: usize,
}

/// Build the allocator for `name`/`device_id`, wrapped in an arena when the device allows it.
pub fn create_allocator(
    info: &DeviceAllocatorRegistrationInfo,
    device_id: u32,
    config: &ArenaConfig,
) -> AllocatorPtr {
    let device = (info.factory)(device_id);
    if device.allows_arena() {
        let config = ArenaConfig {
            max_mem: config.max_mem.min(info.max_mem),
            ..config.clone()
        };
        Arc::new(Arena::new(device, config))
    } else {
        Arc::from(device)
    }
}

pub struct DeviceAllocatorRegistry {
    entries: RwLock<HashMap<String, DeviceAllocatorRegistrationInfo>>,
}

impl DeviceAllocatorRegistry {
    pub fn instance() -> &'static DeviceAllocatorRegistry {
        static REGISTRY: OnceLock<DeviceAllocatorRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            let mut entries = HashMap::new();
            entries.insert(
                CPU.to_string(),
                DeviceAllocatorRegistrationInfo {
                    factory: |_| Box::new(CpuAllocator::new()),
                    max_mem: usize::MAX,
                },
            );
            DeviceAllocatorRegistry {
                entries: RwLock::new(entries),
            }
        })
    }

    pub fn register(&self, name: &str, info: DeviceAllocatorRegistrationInfo) {
        debug!(name, max_mem = info.max_mem, "Registered device allocator");
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), info);
    }

    pub fn get(&self, name: &str) -> Option<DeviceAllocatorRegistrationInfo> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    /// Create the allocator for a memory location registered under `info.name`.
    pub fn create(
        &self,
        info: &AllocatorInfo,
        config: &ArenaConfig,
    ) -> Result<AllocatorPtr, RuntimeError> {
        let registration = self.get(&info.name).ok_or_else(|| {
            RuntimeError::Backend(format!("no device allocator registered for '{}'", info.name))
        })?;
        Ok(create_allocator(&registration, info.device_id, config))
    }
}

/// Shared plain host allocator for caller-owned values (feeds, fetched outputs).
pub fn cpu_allocator() -> AllocatorPtr {
    static CPU_ALLOCATOR: OnceLock<AllocatorPtr> = OnceLock::new();
    Arc::clone(CPU_ALLOCATOR.get_or_init(|| Arc::new(CpuAllocator::new().without_arena())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_registered_by_default() {
        let registry = DeviceAllocatorRegistry::instance();
        let allocator = registry
            .create(&AllocatorInfo::cpu(), &ArenaConfig::default())
            .unwrap();
        assert_eq!(allocator.info(), &AllocatorInfo::cpu());
        assert!(!allocator.allows_arena());
    }

    #[test]
    fn test_unregistered_device() {
        let registry = DeviceAllocatorRegistry::instance();
        let result = registry.create(&AllocatorInfo::new("Nowhere", 0), &ArenaConfig::default());
        assert!(matches!(result, Err(RuntimeError::Backend(_))));
    }

    #[test]
    fn test_max_mem_applied_to_arena() {
        let info = DeviceAllocatorRegistrationInfo {
            factory: |id| Box::new(CpuAllocator::with_info(AllocatorInfo::new("Capped", id))),
            max_mem: 1024,
        };
        let allocator = create_allocator(&info, 3, &ArenaConfig::default());
        assert_eq!(allocator.info(), &AllocatorInfo::new("Capped", 3));
        assert!(allocator.alloc(512).is_ok());
        assert!(matches!(
            allocator.alloc(2048),
            Err(RuntimeError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_plain_device_not_wrapped() {
        let info = DeviceAllocatorRegistrationInfo {
            factory: |_| Box::new(CpuAllocator::new().without_arena()),
            max_mem: usize::MAX,
        };
        let allocator = create_allocator(&info, 0, &ArenaConfig::default());
        let region = allocator.alloc(10).unwrap();
        assert_eq!(region.size(), 10);
        allocator.free(region);
    }
}
