use std::ffi::c_void;

use ascend_ops_rs::{AllocFailure, DeviceAllocator, DeviceBuffer};

pub struct HostBuffer {
    bytes: Vec<u8>,
}

impl DeviceBuffer for HostBuffer {
    fn device_ptr(&self) -> *mut c_void {
        self.bytes.as_ptr() as *mut c_void
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// Host-memory stand-in for a device allocator. Operations that reach the
/// kernel library never run against it; it exists to exercise the
/// validation layer through the public API.
pub struct HostAllocator;

impl DeviceAllocator for HostAllocator {
    fn allocate(&self, len: usize) -> Result<Box<dyn DeviceBuffer>, AllocFailure> {
        Ok(Box::new(HostBuffer {
            bytes: vec![0; len],
        }))
    }

    fn upload(&self, bytes: &[u8]) -> Result<Box<dyn DeviceBuffer>, AllocFailure> {
        Ok(Box::new(HostBuffer {
            bytes: bytes.to_vec(),
        }))
    }
}
