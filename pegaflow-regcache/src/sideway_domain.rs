//! ibverbs registration through `sideway`.

use std::sync::Arc;

use sideway::ibverbs::{
    AccessFlags as VerbsAccess,
    device::{DeviceInfo, DeviceList},
    device_context::DeviceContext,
    memory_region::MemoryRegion as VerbsMemoryRegion,
    protection_domain::ProtectionDomain,
};
use thiserror::Error;

use crate::domain::{AccessFlags, MemoryRegion, RegistrationDomain};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SidewayDomainError {
    #[error("rdma device not found: {0}")]
    DeviceNotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("verbs error: {0}")]
    Verbs(String),
}

/// Local and remote keys of a verbs memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VerbsKey {
    pub lkey: u32,
    pub rkey: u32,
}

/// A protection domain on one NIC. Ranges registered here can be used by
/// any queue pair created from the same protection domain.
pub struct SidewayDomain {
    nic_name: String,
    _device_ctx: Arc<DeviceContext>,
    pd: Arc<ProtectionDomain>,
}

impl SidewayDomain {
    pub fn open(nic_name: &str) -> Result<Self, SidewayDomainError> {
        if nic_name.trim().is_empty() {
            return Err(SidewayDomainError::InvalidArgument("nic_name is empty"));
        }
        let device_list =
            DeviceList::new().map_err(|error| SidewayDomainError::Verbs(error.to_string()))?;
        let device = device_list
            .iter()
            .find(|device| device.name() == nic_name)
            .ok_or_else(|| SidewayDomainError::DeviceNotFound(nic_name.to_string()))?;

        let device_ctx = device
            .open()
            .map_err(|error| SidewayDomainError::Verbs(error.to_string()))?;
        let pd = device_ctx
            .alloc_pd()
            .map_err(|error| SidewayDomainError::Verbs(error.to_string()))?;
        log::info!("opened protection domain on {nic_name}");

        Ok(Self {
            nic_name: nic_name.to_string(),
            _device_ctx: device_ctx,
            pd,
        })
    }

    pub fn nic_name(&self) -> &str {
        &self.nic_name
    }

    pub fn protection_domain(&self) -> &Arc<ProtectionDomain> {
        &self.pd
    }
}

impl RegistrationDomain for SidewayDomain {
    type Region = VerbsRegion;
    type Error = SidewayDomainError;

    fn register_region(
        &self,
        base: u64,
        len: usize,
        access: AccessFlags,
    ) -> Result<VerbsRegion, SidewayDomainError> {
        if base == 0 {
            return Err(SidewayDomainError::InvalidArgument("base must be non-zero"));
        }
        if len == 0 {
            return Err(SidewayDomainError::InvalidArgument("len must be non-zero"));
        }

        // SAFETY: the caller owns [base, base + len) for as long as the
        // returned region lives; the cache deregisters before the buffer is
        // handed back to the allocator.
        let mr = if access.intersects(AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE) {
            unsafe {
                self.pd.reg_mr(
                    base as usize,
                    len,
                    VerbsAccess::LocalWrite | VerbsAccess::RemoteWrite | VerbsAccess::RemoteRead,
                )
            }
        } else {
            unsafe { self.pd.reg_mr(base as usize, len, VerbsAccess::LocalWrite) }
        }
        .map_err(|error| SidewayDomainError::Verbs(error.to_string()))?;

        Ok(VerbsRegion { mr })
    }
}

pub struct VerbsRegion {
    mr: Arc<VerbsMemoryRegion>,
}

impl VerbsRegion {
    pub fn memory_region(&self) -> &Arc<VerbsMemoryRegion> {
        &self.mr
    }
}

impl MemoryRegion for VerbsRegion {
    type Descriptor = VerbsKey;

    fn descriptor(&self) -> VerbsKey {
        VerbsKey {
            lkey: self.mr.lkey(),
            rkey: self.mr.rkey(),
        }
    }
}
