//! Operating system handles used to share memory and semaphores between devices.

use std::io;

use crate::error::RenderError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    /// POSIX file descriptor, ownership moves into the importing driver
    OpaqueFd,
    /// NT handle, stays owned by the process after import
    OpaqueWin32,
}

/// An exported handle, owned until it is imported or closed.
#[derive(Debug)]
pub enum NativeHandle {
    #[cfg(unix)]
    Fd(std::fs::File),
    #[cfg(windows)]
    Win32(std::os::windows::io::OwnedHandle),
}

impl NativeHandle {
    pub fn kind(&self) -> HandleKind {
        match self {
            #[cfg(unix)]
            NativeHandle::Fd(_) => HandleKind::OpaqueFd,
            #[cfg(windows)]
            NativeHandle::Win32(_) => HandleKind::OpaqueWin32,
        }
    }
}

/// A device object whose backing allocation can be exported.
pub trait ExportSource {
    fn export(&self, kind: HandleKind) -> Result<NativeHandle, RenderError>;
}

/// The platform specific part of the bridge, chosen once by [`select_platform`].
pub trait PlatformHandle {
    fn kind(&self) -> HandleKind;

    fn export_memory(&self, memory: &dyn ExportSource) -> Result<NativeHandle, RenderError> {
        let handle = memory.export(self.kind())?;
        self.check_kind("memory", &handle)?;
        Ok(handle)
    }

    fn export_semaphore(&self, semaphore: &dyn ExportSource) -> Result<NativeHandle, RenderError> {
        let handle = semaphore.export(self.kind())?;
        self.check_kind("semaphore", &handle)?;
        Ok(handle)
    }

    fn close(&self, handle: NativeHandle) -> io::Result<()>;

    fn check_kind(&self, what: &str, handle: &NativeHandle) -> Result<(), RenderError> {
        if handle.kind() != self.kind() {
            return Err(RenderError::export(
                what,
                format!("got a {:?} handle, expected {:?}", handle.kind(), self.kind()),
            ));
        }
        Ok(())
    }
}

#[cfg(unix)]
#[derive(Debug, Default)]
pub struct OpaqueFdPlatform;

#[cfg(unix)]
impl PlatformHandle for OpaqueFdPlatform {
    fn kind(&self) -> HandleKind {
        HandleKind::OpaqueFd
    }

    fn close(&self, handle: NativeHandle) -> io::Result<()> {
        let NativeHandle::Fd(file) = handle;
        drop(file);
        Ok(())
    }
}

#[cfg(windows)]
#[derive(Debug, Default)]
pub struct OpaqueWin32Platform;

#[cfg(windows)]
impl PlatformHandle for OpaqueWin32Platform {
    fn kind(&self) -> HandleKind {
        HandleKind::OpaqueWin32
    }

    fn close(&self, handle: NativeHandle) -> io::Result<()> {
        let NativeHandle::Win32(handle) = handle;
        drop(handle);
        Ok(())
    }
}

pub fn select_platform() -> Box<dyn PlatformHandle> {
    #[cfg(unix)]
    let platform: Box<dyn PlatformHandle> = Box::new(OpaqueFdPlatform);
    #[cfg(windows)]
    let platform: Box<dyn PlatformHandle> = Box::new(OpaqueWin32Platform);

    log::debug!("sharing device objects through {:?} handles", platform.kind());
    platform
}
