//! Filesystem view of a process: root, working directory and umask.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use spin::Mutex;

/// A resolved location in the VFS, as handed to the loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewPath(String);

impl ViewPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct FsState {
    root: ViewPath,
    work_dir: ViewPath,
    umask: u32,
}

/// Per-process filesystem context.
#[derive(Debug)]
pub struct FsContext {
    state: Mutex<FsState>,
}

impl FsContext {
    /// Fresh context rooted (and positioned) at `root`.
    pub fn create(root: ViewPath, umask: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FsState {
                work_dir: root.clone(),
                root,
                umask: umask & 0o777,
            }),
        })
    }

    /// Independent copy, as used by fork.
    pub fn clone(original: &FsContext) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(original.state.lock().clone()),
        })
    }

    pub fn root(&self) -> ViewPath {
        self.state.lock().root.clone()
    }

    pub fn working_directory(&self) -> ViewPath {
        self.state.lock().work_dir.clone()
    }

    pub fn umask(&self) -> u32 {
        self.state.lock().umask
    }

    pub fn change_root(&self, root: ViewPath) {
        self.state.lock().root = root;
    }

    pub fn change_working_directory(&self, work_dir: ViewPath) {
        self.state.lock().work_dir = work_dir;
    }

    /// Install a new umask and return the previous one.
    pub fn set_umask(&self, mask: u32) -> u32 {
        let mut state = self.state.lock();
        core::mem::replace(&mut state.umask, mask & 0o777)
    }
}
