//! Address space area tracking
//!
//! A [`VmContext`] owns one address space capability and the map of regions
//! mapped into it. The map is kept in lockstep with the kernel: every
//! operation first performs the kernel call and then updates the map, so
//! that a failed kernel call never leaves a stale region behind.
//!
//! Regions never overlap. Operations that touch part of a region first
//! split it at the boundaries of the target range so that every region is
//! either fully inside or fully outside the range.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::error::{Error, KernelError, Result};
use crate::platform::{File, Handle, KernelResult, MapFlags, Microkernel, UniqueHandle};

/// Round `size` up to page granularity.
pub const fn page_align(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// One mapped region.
struct Area {
    size: u64,
    flags: MapFlags,
    copy_on_write: bool,
    file: Option<Arc<dyn File>>,
    /// Byte offset into the backing file.
    offset: u64,
    /// Offset of this region's first byte inside the mapped view.
    view_offset: u64,
    file_view: Option<UniqueHandle>,
    copy_view: Option<UniqueHandle>,
}

impl Area {
    /// Cut the area `distance` bytes in and return the right part.
    fn split_off(&mut self, distance: u64) -> KernelResult<Area> {
        debug_assert!(distance > 0 && distance < self.size);

        let right = Area {
            size: self.size - distance,
            flags: self.flags,
            copy_on_write: self.copy_on_write,
            file: self.file.clone(),
            offset: self.offset + distance,
            view_offset: self.view_offset + distance,
            file_view: self.file_view.as_ref().map(UniqueHandle::dup).transpose()?,
            copy_view: self.copy_view.as_ref().map(UniqueHandle::dup).transpose()?,
        };
        self.size = distance;
        Ok(right)
    }

    /// The view that is actually mapped into the space.
    fn mapped_view(&self) -> Option<&UniqueHandle> {
        if self.copy_on_write {
            self.copy_view.as_ref()
        } else {
            self.file_view.as_ref()
        }
    }
}

/// Handle-free snapshot of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub address: u64,
    pub size: u64,
    pub flags: MapFlags,
    pub copy_on_write: bool,
    pub offset: u64,
    pub has_file: bool,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.address + self.size
    }
}

/// Per-process address space.
pub struct VmContext {
    kernel: Arc<dyn Microkernel>,
    space: UniqueHandle,
    areas: Mutex<BTreeMap<u64, Area>>,
    log_cleanup: bool,
}

impl VmContext {
    /// Create an empty address space.
    pub fn create(kernel: Arc<dyn Microkernel>, log_cleanup: bool) -> Result<Arc<Self>> {
        let space = UniqueHandle::new(kernel.clone(), kernel.create_space()?);
        Ok(Arc::new(Self {
            kernel,
            space,
            areas: Mutex::new(BTreeMap::new()),
            log_cleanup,
        }))
    }

    /// Build the address space of a forked child.
    ///
    /// Copy-on-write regions get a forked copy view, so parent and child see
    /// private pages from now on. Other regions share the backing view.
    pub fn clone(original: &VmContext) -> Result<Arc<Self>> {
        let kernel = original.kernel.clone();
        let space = UniqueHandle::new(kernel.clone(), kernel.create_space()?);
        let mut tree = BTreeMap::new();

        let areas = original.areas.lock();
        for (&address, area) in areas.iter() {
            let copy_view = if area.copy_on_write {
                let source = area
                    .copy_view
                    .as_ref()
                    .ok_or(Error::Kernel(KernelError::BadDescriptor))?;
                Some(UniqueHandle::new(
                    kernel.clone(),
                    kernel.fork_memory(source.handle())?,
                ))
            } else {
                None
            };

            let view = copy_view
                .as_ref()
                .or_else(|| area.mapped_view())
                .ok_or(Error::Kernel(KernelError::BadDescriptor))?;
            kernel.map_memory(
                view.handle(),
                space.handle(),
                Some(address),
                area.view_offset,
                area.size,
                area.flags | MapFlags::FIXED,
            )?;

            tree.insert(
                address,
                Area {
                    size: area.size,
                    flags: area.flags,
                    copy_on_write: area.copy_on_write,
                    file: area.file.clone(),
                    offset: area.offset,
                    view_offset: area.view_offset,
                    file_view: area.file_view.as_ref().map(UniqueHandle::dup).transpose()?,
                    copy_view,
                },
            );
        }
        drop(areas);

        log::trace!(
            "[POSIX VM] Cloned {} regions into space {:?}",
            tree.len(),
            space.handle()
        );

        Ok(Arc::new(Self {
            kernel,
            space,
            areas: Mutex::new(tree),
            log_cleanup: original.log_cleanup,
        }))
    }

    /// The address space capability.
    pub fn space(&self) -> Handle {
        self.space.handle()
    }

    /// Split regions straddling `address` or `address + size`.
    ///
    /// Afterwards every region that intersects the range lies fully inside it.
    fn split_range(areas: &mut BTreeMap<u64, Area>, address: u64, size: u64) -> KernelResult<()> {
        Self::split_at(areas, address)?;
        Self::split_at(areas, address + size)
    }

    fn split_at(areas: &mut BTreeMap<u64, Area>, address: u64) -> KernelResult<()> {
        let Some((&base, area)) = areas.range_mut(..address).next_back() else {
            return Ok(());
        };
        if base + area.size <= address {
            return Ok(());
        }
        let right = area.split_off(address - base)?;
        areas.insert(address, right);
        Ok(())
    }

    /// Drop every region starting inside the range. Call after `split_range`.
    fn remove_range(areas: &mut BTreeMap<u64, Area>, address: u64, size: u64) {
        let mut inside = areas.split_off(&address);
        let mut after = inside.split_off(&(address + size));
        areas.append(&mut after);
    }

    /// Map `size` bytes of `memory` (or anonymous zero memory).
    ///
    /// Copy-on-write mappings go through a private copy view so that writes
    /// never reach `memory`. Existing regions inside the target range are
    /// replaced.
    pub fn map_file(
        &self,
        hint: Option<u64>,
        memory: Option<UniqueHandle>,
        file: Option<Arc<dyn File>>,
        offset: u64,
        size: u64,
        copy_on_write: bool,
        flags: MapFlags,
    ) -> Result<u64> {
        let size = page_align(size);

        let (copy_view, view_offset, mapped) = if copy_on_write {
            let source = memory
                .as_ref()
                .map_or_else(|| self.kernel.zero_memory(), UniqueHandle::handle);
            let view = UniqueHandle::new(
                self.kernel.clone(),
                self.kernel.copy_on_write(source, offset, size)?,
            );
            let mapped =
                self.kernel
                    .map_memory(view.handle(), self.space.handle(), hint, 0, size, flags);
            (Some(view), 0, mapped)
        } else {
            let Some(memory) = memory.as_ref() else {
                return Err(Error::IllegalArguments);
            };
            let mapped = self.kernel.map_memory(
                memory.handle(),
                self.space.handle(),
                hint,
                offset,
                size,
                flags,
            );
            (None, offset, mapped)
        };

        let address = match mapped {
            Ok(address) => address,
            Err(KernelError::AlreadyExists) => return Err(Error::AlreadyMapped),
            Err(KernelError::NoMemory) => return Err(Error::OutOfMemory),
            Err(e) => return Err(e.into()),
        };

        let mut areas = self.areas.lock();
        Self::split_range(&mut areas, address, size)?;
        Self::remove_range(&mut areas, address, size);
        areas.insert(
            address,
            Area {
                size,
                flags: flags - MapFlags::PLACEMENT,
                copy_on_write,
                file,
                offset,
                view_offset,
                file_view: memory,
                copy_view,
            },
        );

        log::trace!(
            "[POSIX VM] Mapped {:#x}..{:#x} (cow: {})",
            address,
            address + size,
            copy_on_write
        );
        Ok(address)
    }

    /// Move a shared file mapping to a new, kernel-chosen address with a new size.
    ///
    /// # Panics
    ///
    /// The region must exist at `address` with exactly `old_size` bytes, must
    /// not be copy-on-write and must be file-backed.
    pub async fn remap_file(&self, address: u64, old_size: u64, new_size: u64) -> Result<u64> {
        let old_size = page_align(old_size);
        let new_size = page_align(new_size);

        let (file, offset, flags) = {
            let areas = self.areas.lock();
            let Some(area) = areas.get(&address) else {
                panic!("remap of unknown region {:#x}", address);
            };
            assert_eq!(area.size, old_size, "remap size mismatch at {:#x}", address);
            assert!(!area.copy_on_write, "remap of copy-on-write region {:#x}", address);
            let Some(file) = area.file.clone() else {
                panic!("remap of region {:#x} without backing file", address);
            };
            (file, area.offset, area.flags)
        };

        let memory = file.access_memory().await?;

        let new_address = self.kernel.map_memory(
            memory.handle(),
            self.space.handle(),
            None,
            offset,
            new_size,
            flags,
        )?;
        self.kernel.unmap_memory(self.space.handle(), address, old_size)?;

        let mut areas = self.areas.lock();
        let old = areas.remove(&address);
        debug_assert!(old.is_some());
        if let Some((&base, pred)) = areas.range(..new_address + new_size).next_back() {
            debug_assert!(base + pred.size <= new_address);
        }
        areas.insert(
            new_address,
            Area {
                size: new_size,
                flags,
                copy_on_write: false,
                file: Some(file),
                offset,
                view_offset: offset,
                file_view: Some(memory),
                copy_view: None,
            },
        );
        drop(areas);
        drop(old);

        log::trace!(
            "[POSIX VM] Remapped {:#x} to {:#x} ({:#x} bytes)",
            address,
            new_address,
            new_size
        );
        Ok(new_address)
    }

    /// Change permissions of a page range.
    ///
    /// Only the permission bits of the affected regions change; caching
    /// bits are preserved.
    pub async fn protect_file(&self, address: u64, size: u64, flags: MapFlags) -> Result<()> {
        let size = page_align(size);
        self.kernel
            .protect_memory(self.space.handle(), address, size, flags)
            .await?;

        let protection = flags & MapFlags::PROTECTION;
        let mut areas = self.areas.lock();
        Self::split_range(&mut areas, address, size)?;
        for (_, area) in areas.range_mut(address..address + size) {
            area.flags = (area.flags - MapFlags::PROTECTION) | protection;
        }
        Ok(())
    }

    /// Unmap a page range.
    pub fn unmap_file(&self, address: u64, size: u64) -> Result<()> {
        let size = page_align(size);
        self.kernel
            .unmap_memory(self.space.handle(), address, size)?;

        let mut areas = self.areas.lock();
        Self::split_range(&mut areas, address, size)?;
        Self::remove_range(&mut areas, address, size);

        log::trace!("[POSIX VM] Unmapped {:#x}..{:#x}", address, address + size);
        Ok(())
    }

    /// Snapshot of all regions in address order.
    pub fn regions(&self) -> Vec<Region> {
        self.areas
            .lock()
            .iter()
            .map(|(&address, area)| Region {
                address,
                size: area.size,
                flags: area.flags,
                copy_on_write: area.copy_on_write,
                offset: area.offset,
                has_file: area.file.is_some(),
            })
            .collect()
    }

    /// The region containing `address`, if any.
    pub fn region_containing(&self, address: u64) -> Option<Region> {
        self.regions()
            .into_iter()
            .find(|r| r.address <= address && address < r.end())
    }
}

impl fmt::Debug for VmContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmContext")
            .field("space", &self.space)
            .field("regions", &self.areas.lock().len())
            .finish()
    }
}

impl Drop for VmContext {
    fn drop(&mut self) {
        if self.log_cleanup {
            log::debug!("[POSIX VM] VmContext is destructed");
        }
    }
}
