//! Seams to the fabric layer: something that can register a virtual range
//! for remote access, and the registration it hands back.

use std::fmt::Display;

use bitflags::bitflags;

bitflags! {
    /// Access rights requested for a registered range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const LOCAL_READ = 1 << 0;
        const LOCAL_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_WRITE = 1 << 3;
    }
}

impl AccessFlags {
    /// What the cache asks for: the NIC may read and write the buffer on
    /// behalf of put/get. Verbs providers reject remote write without local
    /// write, so it is included.
    pub const DATAPATH: AccessFlags = AccessFlags::LOCAL_WRITE
        .union(AccessFlags::REMOTE_READ)
        .union(AccessFlags::REMOTE_WRITE);
}

/// One live registration. Dropping it releases the registration.
pub trait MemoryRegion: Send + Sync + 'static {
    /// Token a transfer passes to reference this registration locally.
    type Descriptor: Clone + Send + Sync + 'static;

    fn descriptor(&self) -> Self::Descriptor;
}

pub trait RegistrationDomain {
    type Region: MemoryRegion;
    type Error: Display;

    fn register_region(
        &self,
        base: u64,
        len: usize,
        access: AccessFlags,
    ) -> std::result::Result<Self::Region, Self::Error>;
}

impl<D: RegistrationDomain + ?Sized> RegistrationDomain for &D {
    type Region = D::Region;
    type Error = D::Error;

    fn register_region(
        &self,
        base: u64,
        len: usize,
        access: AccessFlags,
    ) -> std::result::Result<Self::Region, Self::Error> {
        (**self).register_region(base, len, access)
    }
}
