//! Kernel-wide error taxonomy used at the boundary of the memory, block,
//! cache, and partition layers. Fatal CPU exceptions are not a value of this
//! enum; they surface through the panic path instead.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    DeviceTimeout,
    DeviceError,
    InvalidArgument,
    NotReady,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::DeviceTimeout => write!(f, "device timed out"),
            KernelError::DeviceError => write!(f, "device reported an error"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::NotReady => write!(f, "device not ready"),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
