use std::ffi::c_void;

use log::trace;

use crate::descriptor::DType;
use crate::error::{AscendOpsError, KernelPhase};
use crate::ffi::AclrtStream;

/// A region of device memory. Implementations own the region and release
/// it on drop; this layer only borrows or transfers whole buffers.
pub trait DeviceBuffer {
    fn device_ptr(&self) -> *mut c_void;
    /// Length in bytes.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Why a device allocation could not be served.
#[derive(Debug, Clone)]
pub struct AllocFailure {
    pub code: i32,
    pub message: String,
}

/// Device allocator borrowed from the host tensor runtime. Workspace and
/// output buffers are drawn from here; nothing is pooled or reused across
/// calls by this layer.
pub trait DeviceAllocator {
    fn allocate(&self, len: usize) -> Result<Box<dyn DeviceBuffer>, AllocFailure>;
    /// Allocate `bytes.len()` device bytes and copy `bytes` into them.
    fn upload(&self, bytes: &[u8]) -> Result<Box<dyn DeviceBuffer>, AllocFailure>;
}

/// Execution context for one operation call: the target device, the stream
/// the kernel is enqueued on, and the allocator transient buffers come
/// from. The stream must already be current for the calling thread; this
/// layer neither creates nor synchronizes streams.
pub struct ExecutionContext<'a> {
    device_id: i32,
    stream: AclrtStream,
    allocator: &'a dyn DeviceAllocator,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(device_id: i32, stream: AclrtStream, allocator: &'a dyn DeviceAllocator) -> Self {
        Self {
            device_id,
            stream,
            allocator,
        }
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn stream(&self) -> AclrtStream {
        self.stream
    }

    /// Every operand must live on the context's device; kernels address
    /// operand memory relative to the device the stream belongs to.
    pub(crate) fn ensure_same_device(
        &self,
        op: &'static str,
        argument: &'static str,
        device_id: i32,
    ) -> Result<(), AscendOpsError> {
        if device_id != self.device_id {
            return Err(AscendOpsError::invalid_argument(
                op,
                argument,
                format!("tensor on context device {}", self.device_id),
                format!("device {device_id}"),
            ));
        }
        Ok(())
    }

    /// Scratch buffer for one kernel execution. A zero-byte request
    /// allocates nothing; the execute phase then receives a null pointer.
    pub(crate) fn allocate_workspace(
        &self,
        op: &'static str,
        size: u64,
    ) -> Result<Workspace, AscendOpsError> {
        if size == 0 {
            return Ok(Workspace { buffer: None });
        }
        trace!("{op}: allocating {size} byte workspace");
        let buffer = self
            .allocator
            .allocate(size as usize)
            .map_err(|failure| alloc_error(op, "workspace", size as usize, failure))?;
        Ok(Workspace {
            buffer: Some(buffer),
        })
    }

    pub(crate) fn allocate_output(
        &self,
        op: &'static str,
        what: &'static str,
        dims: Vec<i64>,
        dtype: DType,
    ) -> Result<DeviceTensor, AscendOpsError> {
        let elems: i64 = dims.iter().product();
        let bytes = elems as usize * dtype.size_bytes();
        let buffer = self
            .allocator
            .allocate(bytes)
            .map_err(|failure| alloc_error(op, what, bytes, failure))?;
        Ok(DeviceTensor {
            buffer,
            dims,
            dtype,
            device_id: self.device_id,
        })
    }

    /// Stage a host scalar/array into a fresh device buffer.
    pub(crate) fn upload_host(
        &self,
        op: &'static str,
        what: &'static str,
        bytes: &[u8],
    ) -> Result<Box<dyn DeviceBuffer>, AscendOpsError> {
        self.allocator
            .upload(bytes)
            .map_err(|failure| alloc_error(op, what, bytes.len(), failure))
    }
}

fn alloc_error(
    op: &'static str,
    what: &'static str,
    bytes: usize,
    failure: AllocFailure,
) -> AscendOpsError {
    AscendOpsError::kernel_execution(
        op,
        KernelPhase::DeviceAlloc,
        failure.code,
        format!("{what} allocation of {bytes} bytes failed: {}", failure.message),
    )
}

/// Scratch memory for a single kernel execution, dropped (and thereby
/// returned to the allocator) when the invocation scope ends.
pub(crate) struct Workspace {
    buffer: Option<Box<dyn DeviceBuffer>>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("len_bytes", &self.buffer.as_ref().map(|b| b.len()).unwrap_or(0))
            .finish()
    }
}

impl Workspace {
    pub(crate) fn device_ptr(&self) -> *mut c_void {
        match &self.buffer {
            Some(buffer) => buffer.device_ptr(),
            None => std::ptr::null_mut(),
        }
    }

    pub(crate) fn size(&self) -> u64 {
        match &self.buffer {
            Some(buffer) => buffer.len() as u64,
            None => 0,
        }
    }
}

/// A dense output tensor allocated by an operation and handed back to the
/// caller, who owns the backing buffer from then on.
pub struct DeviceTensor {
    buffer: Box<dyn DeviceBuffer>,
    dims: Vec<i64>,
    dtype: DType,
    device_id: i32,
}

impl std::fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("dims", &self.dims)
            .field("dtype", &self.dtype)
            .field("device_id", &self.device_id)
            .field("len_bytes", &self.buffer.len())
            .finish()
    }
}

impl DeviceTensor {
    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    /// Row-major dense strides matching `dims`.
    pub fn strides(&self) -> Vec<i64> {
        let mut strides = vec![1_i64; self.dims.len()];
        for axis in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.dims[axis + 1];
        }
        strides
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn device_ptr(&self) -> *mut c_void {
        self.buffer.device_ptr()
    }

    pub fn elem_count(&self) -> i64 {
        self.dims.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_buffer(self) -> Box<dyn DeviceBuffer> {
        self.buffer
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    pub(crate) struct HostBuffer {
        bytes: RefCell<Vec<u8>>,
    }

    impl DeviceBuffer for HostBuffer {
        fn device_ptr(&self) -> *mut c_void {
            self.bytes.borrow_mut().as_mut_ptr().cast()
        }

        fn len(&self) -> usize {
            self.bytes.borrow().len()
        }
    }

    /// Host-memory stand-in for the device allocator; kernels are never
    /// actually launched against it.
    #[derive(Default)]
    pub(crate) struct HostAllocator {
        pub(crate) fail_next: RefCell<bool>,
    }

    impl DeviceAllocator for HostAllocator {
        fn allocate(&self, len: usize) -> Result<Box<dyn DeviceBuffer>, AllocFailure> {
            if self.fail_next.replace(false) {
                return Err(AllocFailure {
                    code: 207001,
                    message: "out of device memory".to_string(),
                });
            }
            Ok(Box::new(HostBuffer {
                bytes: RefCell::new(vec![0; len]),
            }))
        }

        fn upload(&self, bytes: &[u8]) -> Result<Box<dyn DeviceBuffer>, AllocFailure> {
            if self.fail_next.replace(false) {
                return Err(AllocFailure {
                    code: 207001,
                    message: "out of device memory".to_string(),
                });
            }
            Ok(Box::new(HostBuffer {
                bytes: RefCell::new(bytes.to_vec()),
            }))
        }
    }
}
