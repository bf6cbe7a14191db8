//! Descriptor table of a process.
//!
//! Every open descriptor is mirrored into the process's universe: attaching
//! a file transfers its passthrough lane into the universe, closing it
//! closes the transferred handle again.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::platform::{File, Handle, Microkernel, TransferDirection, UniqueHandle};

/// One entry of the descriptor table.
#[derive(Clone)]
pub struct FileDescriptor {
    pub file: Arc<dyn File>,
    pub close_on_exec: bool,
    /// Passthrough lane as seen from inside the universe.
    client_handle: Handle,
}

impl FileDescriptor {
    pub fn client_handle(&self) -> Handle {
        self.client_handle
    }
}

impl fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("close_on_exec", &self.close_on_exec)
            .field("client_handle", &self.client_handle)
            .finish()
    }
}

/// Per-process file descriptor table.
pub struct FileContext {
    kernel: Arc<dyn Microkernel>,
    universe: UniqueHandle,
    /// Server-side mbus lane that is handed to every new universe.
    mbus_lane: Handle,
    client_mbus_lane: Handle,
    table: Mutex<BTreeMap<i32, FileDescriptor>>,
    log_file_attach: bool,
    log_cleanup: bool,
}

impl FileContext {
    /// Create an empty table in a fresh universe.
    pub fn create(
        kernel: Arc<dyn Microkernel>,
        mbus_lane: Handle,
        config: &ServerConfig,
    ) -> Result<Arc<Self>> {
        let universe = UniqueHandle::new(kernel.clone(), kernel.create_universe()?);
        let client_mbus_lane =
            kernel.transfer_descriptor(mbus_lane, universe.handle(), TransferDirection::Out)?;

        Ok(Arc::new(Self {
            kernel,
            universe,
            mbus_lane,
            client_mbus_lane,
            table: Mutex::new(BTreeMap::new()),
            log_file_attach: config.log_file_attach,
            log_cleanup: config.log_cleanup,
        }))
    }

    /// Copy the table into a fresh universe, as used by fork.
    pub fn clone(original: &FileContext) -> Result<Arc<Self>> {
        let universe =
            UniqueHandle::new(original.kernel.clone(), original.kernel.create_universe()?);
        let client_mbus_lane = original.kernel.transfer_descriptor(
            original.mbus_lane,
            universe.handle(),
            TransferDirection::Out,
        )?;

        let context = Self {
            kernel: original.kernel.clone(),
            universe,
            mbus_lane: original.mbus_lane,
            client_mbus_lane,
            table: Mutex::new(BTreeMap::new()),
            log_file_attach: original.log_file_attach,
            log_cleanup: original.log_cleanup,
        };

        let entries: Vec<(i32, FileDescriptor)> = original
            .table
            .lock()
            .iter()
            .map(|(&fd, desc)| (fd, desc.clone()))
            .collect();
        for (fd, desc) in entries {
            context.attach_file_at(fd, desc.file, desc.close_on_exec)?;
        }

        Ok(Arc::new(context))
    }

    /// The universe descriptors live in.
    pub fn universe(&self) -> Handle {
        self.universe.handle()
    }

    /// The mbus lane as seen from inside the universe.
    pub fn client_mbus_lane(&self) -> Handle {
        self.client_mbus_lane
    }

    fn transfer(&self, file: &Arc<dyn File>) -> Result<Handle> {
        Ok(self.kernel.transfer_descriptor(
            file.passthrough_lane(),
            self.universe.handle(),
            TransferDirection::Out,
        )?)
    }

    /// Attach `file` at the lowest free descriptor not below `start_at`.
    pub fn attach_file(
        &self,
        file: Arc<dyn File>,
        close_on_exec: bool,
        start_at: i32,
    ) -> Result<i32> {
        let client_handle = self.transfer(&file)?;

        let mut table = self.table.lock();
        let mut fd = start_at;
        for used in table.range(start_at..).map(|(&used, _)| used) {
            if used != fd {
                break;
            }
            fd += 1;
        }

        if self.log_file_attach {
            log::debug!("[POSIX PROC] Attaching FD {}", fd);
        }
        table.insert(
            fd,
            FileDescriptor {
                file,
                close_on_exec,
                client_handle,
            },
        );
        Ok(fd)
    }

    /// Attach `file` at exactly `fd`, replacing whatever was there.
    pub fn attach_file_at(&self, fd: i32, file: Arc<dyn File>, close_on_exec: bool) -> Result<()> {
        let client_handle = self.transfer(&file)?;

        if self.log_file_attach {
            log::debug!("[POSIX PROC] Attaching fixed FD {}", fd);
        }
        let previous = self.table.lock().insert(
            fd,
            FileDescriptor {
                file,
                close_on_exec,
                client_handle,
            },
        );
        if let Some(previous) = previous {
            self.kernel
                .close_descriptor(self.universe.handle(), previous.client_handle)?;
        }
        Ok(())
    }

    pub fn descriptor(&self, fd: i32) -> Option<FileDescriptor> {
        self.table.lock().get(&fd).cloned()
    }

    pub fn file(&self, fd: i32) -> Option<Arc<dyn File>> {
        self.table.lock().get(&fd).map(|desc| desc.file.clone())
    }

    pub fn set_close_on_exec(&self, fd: i32, close_on_exec: bool) -> Result<()> {
        let mut table = self.table.lock();
        let desc = table.get_mut(&fd).ok_or(Error::NoSuchFile)?;
        desc.close_on_exec = close_on_exec;
        Ok(())
    }

    pub fn close_file(&self, fd: i32) -> Result<()> {
        if self.log_file_attach {
            log::debug!("[POSIX PROC] Closing FD {}", fd);
        }
        let desc = self.table.lock().remove(&fd).ok_or(Error::NoSuchFile)?;
        self.kernel
            .close_descriptor(self.universe.handle(), desc.client_handle)?;
        Ok(())
    }

    /// Close every descriptor flagged close-on-exec.
    pub fn close_on_exec(&self) -> Result<()> {
        let closed: Vec<FileDescriptor> = {
            let mut table = self.table.lock();
            let flagged: Vec<i32> = table
                .iter()
                .filter(|(_, desc)| desc.close_on_exec)
                .map(|(&fd, _)| fd)
                .collect();
            flagged.iter().filter_map(|fd| table.remove(fd)).collect()
        };

        for desc in closed {
            self.kernel
                .close_descriptor(self.universe.handle(), desc.client_handle)?;
        }
        Ok(())
    }

    /// Open descriptors in ascending order.
    pub fn descriptors(&self) -> Vec<i32> {
        self.table.lock().keys().copied().collect()
    }
}

impl fmt::Debug for FileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileContext")
            .field("universe", &self.universe)
            .field("descriptors", &self.table.lock().len())
            .finish()
    }
}

impl Drop for FileContext {
    fn drop(&mut self) {
        if self.log_cleanup {
            log::debug!("[POSIX PROC] FileContext is destructed");
        }
    }
}
