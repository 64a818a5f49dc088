//! Device registry: platform and device discovery and selection

use crate::driver::{DeviceClass, DeviceId, DeviceInfo, Driver, PlatformId, PlatformInfo};
use crate::drivers::HostDriver;
use crate::error::{DispatchError, Result};
use std::fmt;
use std::sync::Arc;

/// A compute platform (one driver/vendor implementation)
#[derive(Clone)]
pub struct Platform {
    info: PlatformInfo,
    driver: Arc<dyn Driver>,
}

impl Platform {
    pub fn id(&self) -> PlatformId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn vendor(&self) -> &str {
        &self.info.vendor
    }

    pub fn version(&self) -> &str {
        &self.info.version
    }

    pub fn info(&self) -> &PlatformInfo {
        &self.info
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("info", &self.info)
            .field("driver", &self.driver.name())
            .finish()
    }
}

/// A compute unit exposed by a platform
#[derive(Clone)]
pub struct Device {
    info: DeviceInfo,
    driver: Arc<dyn Driver>,
}

impl Device {
    pub fn id(&self) -> DeviceId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn class(&self) -> DeviceClass {
        self.info.class
    }

    /// Device memory in bytes
    pub fn global_mem_size(&self) -> u64 {
        self.info.global_mem_size
    }

    pub fn max_work_group_size(&self) -> usize {
        self.info.max_work_group_size
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("driver", &self.driver.name())
            .finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.info == other.info && self.driver.name() == other.driver.name()
    }
}

/// Enumerates the platforms and devices a driver exposes
#[derive(Clone)]
pub struct DeviceRegistry {
    driver: Arc<dyn Driver>,
}

impl DeviceRegistry {
    /// Registry over `driver`
    pub fn new(driver: impl Driver + 'static) -> Self {
        Self::from_shared(Arc::new(driver))
    }

    /// Registry over an already shared driver
    pub fn from_shared(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    /// Registry over the default host reference driver
    pub fn host() -> Self {
        Self::new(HostDriver::new())
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    /// All platforms in driver order.
    ///
    /// # Errors
    ///
    /// `NoPlatformFound` when the driver reports none.
    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub fn list_platforms(&self) -> Result<Vec<Platform>> {
        let infos = self.driver.platforms()?;
        if infos.is_empty() {
            tracing::warn!("no compute platforms reported");
            return Err(DispatchError::NoPlatformFound);
        }
        tracing::debug!(count = infos.len(), "platforms enumerated");
        Ok(infos
            .into_iter()
            .map(|info| Platform {
                info,
                driver: Arc::clone(&self.driver),
            })
            .collect())
    }

    /// All devices of `platform` in driver order.
    ///
    /// # Errors
    ///
    /// `NoDeviceFound` when the platform exposes none.
    #[tracing::instrument(skip(self, platform), fields(platform = platform.name()))]
    pub fn list_devices(&self, platform: &Platform) -> Result<Vec<Device>> {
        let infos = platform.driver().devices(platform.id())?;
        if infos.is_empty() {
            return Err(DispatchError::NoDeviceFound {
                platform: platform.name().to_string(),
            });
        }
        tracing::debug!(count = infos.len(), "devices enumerated");
        Ok(infos
            .into_iter()
            .map(|info| Device {
                info,
                driver: Arc::clone(platform.driver()),
            })
            .collect())
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("driver", &self.driver.name())
            .finish()
    }
}

fn select<T: Clone>(what: &'static str, items: &[T], index: usize) -> Result<T> {
    items.get(index).cloned().ok_or(DispatchError::InvalidSelection {
        what,
        index,
        available: items.len(),
    })
}

/// Pick the platform at `index`
pub fn select_platform(platforms: &[Platform], index: usize) -> Result<Platform> {
    let platform = select("platform", platforms, index)?;
    tracing::info!(index, name = platform.name(), vendor = platform.vendor(), "platform selected");
    Ok(platform)
}

/// Pick the device at `index`
pub fn select_device(devices: &[Device], index: usize) -> Result<Device> {
    let device = select("device", devices, index)?;
    tracing::info!(index, name = device.name(), class = %device.class(), "device selected");
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{HostDeviceSpec, HostPlatformSpec};

    #[test]
    fn test_host_registry_lists_reference_platform() {
        let registry = DeviceRegistry::host();
        let platforms = registry.list_platforms().unwrap();
        assert_eq!(platforms.len(), 1);
        assert_eq!(platforms[0].name(), "Host Reference Platform");

        let devices = registry.list_devices(&platforms[0]).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].class(), DeviceClass::Cpu);
    }

    #[test]
    fn test_no_platform_found() {
        let registry = DeviceRegistry::new(HostDriver::empty());
        assert!(matches!(registry.list_platforms(), Err(DispatchError::NoPlatformFound)));
    }

    #[test]
    fn test_no_device_found() {
        let registry = DeviceRegistry::new(HostDriver::with_platforms(vec![
            HostPlatformSpec::reference().without_devices(),
        ]));
        let platforms = registry.list_platforms().unwrap();
        let err = registry.list_devices(&platforms[0]).unwrap_err();
        assert!(matches!(err, DispatchError::NoDeviceFound { ref platform } if platform == "Host Reference Platform"));
    }

    #[test]
    fn test_select_device_valid_and_invalid() {
        let registry = DeviceRegistry::host();
        let platforms = registry.list_platforms().unwrap();
        let devices = registry.list_devices(&platforms[0]).unwrap();

        let device = select_device(&devices, 1).unwrap();
        assert_eq!(device.class(), DeviceClass::Accelerator);

        let err = select_device(&devices, 2).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidSelection {
                what: "device",
                index: 2,
                available: 2
            }
        ));
    }

    #[test]
    fn test_select_platform_out_of_range() {
        let registry = DeviceRegistry::host();
        let platforms = registry.list_platforms().unwrap();
        assert!(matches!(
            select_platform(&platforms, 5),
            Err(DispatchError::InvalidSelection { what: "platform", .. })
        ));
    }

    #[test]
    fn test_custom_device_memory_is_reported() {
        let mut platform = HostPlatformSpec::reference();
        platform.devices = vec![HostDeviceSpec::cpu().with_memory(4096)];
        let registry = DeviceRegistry::new(HostDriver::with_platforms(vec![platform]));
        let platforms = registry.list_platforms().unwrap();
        let devices = registry.list_devices(&platforms[0]).unwrap();
        assert_eq!(devices[0].global_mem_size(), 4096);
    }
}
