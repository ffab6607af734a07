//! Minimal device layer over the ACL runtime API (`aclrt*`), enough to
//! own a device stream, move buffers, and serve as the allocator behind an
//! [`ExecutionContext`]. Serving stacks bring their own runtime; this
//! module exists for integration tests and small standalone tools.

use std::env;
use std::ffi::c_void;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use libloading::os::unix::Library;
use log::debug;

use crate::context::{AllocFailure, DeviceAllocator, DeviceBuffer, ExecutionContext};
use crate::error::AscendOpsError;
use crate::ffi::{ACL_SUCCESS, AclrtStream};

const ENV_ACL_LIBRARY: &str = "ASCEND_OPS_RS_ACL_LIBRARY";
const DEFAULT_ACL_LIBRARY: &str = "libascendcl.so";

const ACL_MEM_MALLOC_HUGE_FIRST: i32 = 0;
const ACL_MEMCPY_HOST_TO_DEVICE: i32 = 1;
const ACL_MEMCPY_DEVICE_TO_HOST: i32 = 2;

type AclrtSetDeviceFn = unsafe extern "C" fn(i32) -> i32;
type AclrtCreateStreamFn = unsafe extern "C" fn(*mut AclrtStream) -> i32;
type AclrtDestroyStreamFn = unsafe extern "C" fn(AclrtStream) -> i32;
type AclrtSynchronizeStreamFn = unsafe extern "C" fn(AclrtStream) -> i32;
type AclrtMallocFn = unsafe extern "C" fn(*mut *mut c_void, usize, i32) -> i32;
type AclrtFreeFn = unsafe extern "C" fn(*mut c_void) -> i32;
type AclrtMemcpyFn = unsafe extern "C" fn(*mut c_void, usize, *const c_void, usize, i32) -> i32;

struct AclrtApi {
    _lib: Library,
    set_device: AclrtSetDeviceFn,
    create_stream: AclrtCreateStreamFn,
    destroy_stream: AclrtDestroyStreamFn,
    synchronize_stream: AclrtSynchronizeStreamFn,
    malloc: AclrtMallocFn,
    free: AclrtFreeFn,
    memcpy: AclrtMemcpyFn,
}

static ACLRT_API: OnceLock<AclrtApi> = OnceLock::new();
static ACLRT_INIT_LOCK: Mutex<()> = Mutex::new(());

impl AclrtApi {
    fn get() -> Result<&'static Self, AscendOpsError> {
        if let Some(api) = ACLRT_API.get() {
            return Ok(api);
        }
        let _guard = ACLRT_INIT_LOCK
            .lock()
            .map_err(|_| AscendOpsError::RuntimeAlreadyInitialized)?;
        if let Some(api) = ACLRT_API.get() {
            return Ok(api);
        }
        // SAFETY: loading and symbol resolution are validated below.
        let api = unsafe { Self::load()? };
        let _ = ACLRT_API.set(api);
        ACLRT_API
            .get()
            .ok_or(AscendOpsError::RuntimeAlreadyInitialized)
    }

    unsafe fn load() -> Result<Self, AscendOpsError> {
        let library = match env::var_os(ENV_ACL_LIBRARY) {
            Some(value) if !value.is_empty() => PathBuf::from(value),
            _ => PathBuf::from(DEFAULT_ACL_LIBRARY),
        };
        let lib =
            unsafe { Library::open(Some(&library), libc::RTLD_NOW | libc::RTLD_GLOBAL) }.map_err(
                |e| AscendOpsError::LibraryLoad {
                    library: library.clone(),
                    message: e.to_string(),
                },
            )?;

        macro_rules! sym {
            ($name:literal) => {
                // SAFETY: the symbol type matches the documented aclrt
                // prototype.
                *unsafe { lib.get(concat!($name, "\0").as_bytes()) }.map_err(|e| {
                    AscendOpsError::SymbolResolve {
                        library: library.clone(),
                        symbol: $name,
                        message: e.to_string(),
                    }
                })?
            };
        }

        let api = Self {
            set_device: sym!("aclrtSetDevice"),
            create_stream: sym!("aclrtCreateStream"),
            destroy_stream: sym!("aclrtDestroyStream"),
            synchronize_stream: sym!("aclrtSynchronizeStream"),
            malloc: sym!("aclrtMalloc"),
            free: sym!("aclrtFree"),
            memcpy: sym!("aclrtMemcpy"),
            _lib: lib,
        };
        debug!("loaded ACL runtime library {}", library.display());
        Ok(api)
    }
}

/// Device memory obtained from `aclrtMalloc`, freed on drop.
pub struct DeviceMemory {
    api: &'static AclrtApi,
    ptr: *mut c_void,
    len: usize,
}

impl DeviceBuffer for DeviceMemory {
    fn device_ptr(&self) -> *mut c_void {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        // SAFETY: ptr came from aclrtMalloc and is freed once.
        let _ = unsafe { (self.api.free)(self.ptr) };
    }
}

/// One NPU device with an owned stream. Implements [`DeviceAllocator`] so
/// an [`ExecutionContext`] can be built directly on top of it.
pub struct AclrtDevice {
    api: &'static AclrtApi,
    device_id: i32,
    stream: AclrtStream,
}

impl AclrtDevice {
    pub fn new(device_id: i32) -> Result<Self, AscendOpsError> {
        let api = AclrtApi::get()?;
        // SAFETY: symbols resolved from the ACL runtime C ABI.
        let code = unsafe { (api.set_device)(device_id) };
        if code != ACL_SUCCESS {
            return Err(AscendOpsError::Aclrt {
                api: "aclrtSetDevice",
                code,
            });
        }
        let mut stream: AclrtStream = std::ptr::null_mut();
        // SAFETY: out-pointer is valid for the call.
        let code = unsafe { (api.create_stream)(&mut stream) };
        if code != ACL_SUCCESS {
            return Err(AscendOpsError::Aclrt {
                api: "aclrtCreateStream",
                code,
            });
        }
        Ok(Self {
            api,
            device_id,
            stream,
        })
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn stream(&self) -> AclrtStream {
        self.stream
    }

    pub fn execution_context(&self) -> ExecutionContext<'_> {
        ExecutionContext::new(self.device_id, self.stream, self)
    }

    /// Block until everything enqueued on the device stream has finished.
    pub fn synchronize(&self) -> Result<(), AscendOpsError> {
        // SAFETY: stream came from aclrtCreateStream.
        let code = unsafe { (self.api.synchronize_stream)(self.stream) };
        if code != ACL_SUCCESS {
            return Err(AscendOpsError::Aclrt {
                api: "aclrtSynchronizeStream",
                code,
            });
        }
        Ok(())
    }

    fn malloc(&self, len: usize) -> Result<DeviceMemory, AllocFailure> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        // SAFETY: out-pointer is valid; HUGE_FIRST is the default policy.
        let code = unsafe { (self.api.malloc)(&mut ptr, len, ACL_MEM_MALLOC_HUGE_FIRST) };
        if code != ACL_SUCCESS || ptr.is_null() {
            return Err(AllocFailure {
                code,
                message: format!("aclrtMalloc({len}) failed"),
            });
        }
        Ok(DeviceMemory {
            api: self.api,
            ptr,
            len,
        })
    }

    /// Copy a device buffer back to the host (synchronous copy).
    pub fn download(&self, buffer: &dyn DeviceBuffer) -> Result<Vec<u8>, AscendOpsError> {
        let mut host = vec![0_u8; buffer.len()];
        // SAFETY: destination is a fresh host allocation of matching size.
        let code = unsafe {
            (self.api.memcpy)(
                host.as_mut_ptr().cast(),
                host.len(),
                buffer.device_ptr(),
                buffer.len(),
                ACL_MEMCPY_DEVICE_TO_HOST,
            )
        };
        if code != ACL_SUCCESS {
            return Err(AscendOpsError::Aclrt {
                api: "aclrtMemcpy",
                code,
            });
        }
        Ok(host)
    }
}

impl DeviceAllocator for AclrtDevice {
    fn allocate(&self, len: usize) -> Result<Box<dyn DeviceBuffer>, AllocFailure> {
        Ok(Box::new(self.malloc(len)?))
    }

    fn upload(&self, bytes: &[u8]) -> Result<Box<dyn DeviceBuffer>, AllocFailure> {
        let memory = self.malloc(bytes.len())?;
        // SAFETY: destination was just allocated with matching size.
        let code = unsafe {
            (self.api.memcpy)(
                memory.device_ptr(),
                memory.len(),
                bytes.as_ptr().cast(),
                bytes.len(),
                ACL_MEMCPY_HOST_TO_DEVICE,
            )
        };
        if code != ACL_SUCCESS {
            return Err(AllocFailure {
                code,
                message: format!("aclrtMemcpy host-to-device of {} bytes failed", bytes.len()),
            });
        }
        Ok(Box::new(memory))
    }
}

impl Drop for AclrtDevice {
    fn drop(&mut self) {
        // SAFETY: stream came from aclrtCreateStream; best-effort teardown.
        let _ = unsafe { (self.api.destroy_stream)(self.stream) };
    }
}
