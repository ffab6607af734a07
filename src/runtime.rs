use std::env;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use libloading::os::unix::Library;
use log::debug;

use crate::descriptor::{DescriptorHost, TensorSpec};
use crate::error::{AscendOpsError, KernelPhase};
use crate::ffi::{
    self, AclCreateTensorFn, AclDestroyTensorFn, AclGetRecentErrMsgFn, AclOpExecutorHandle,
    AclTensorHandle, AclrtStream,
};

const ENV_ACL_LIBRARY: &str = "ASCEND_OPS_RS_ACL_LIBRARY";
const ENV_OPAPI_LIBRARY: &str = "ASCEND_OPS_RS_OPAPI_LIBRARY";
const ENV_OPS_LIBRARY: &str = "ASCEND_OPS_RS_OPS_LIBRARY";

// Default sonames, resolved through the loader search path the CANN
// toolkit environment script sets up.
const DEFAULT_ACL_LIBRARY: &str = "libascendcl.so";
const DEFAULT_OPAPI_LIBRARY: &str = "libopapi.so";
const DEFAULT_OPS_LIBRARY: &str = "libascend910a_ops.so";

type SwiGluGetWorkspaceSizeFn = unsafe extern "C" fn(
    AclTensorHandle,
    AclTensorHandle,
    *mut u64,
    *mut AclOpExecutorHandle,
) -> i32;

type MatMulGetWorkspaceSizeFn = unsafe extern "C" fn(
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    *mut u64,
    *mut AclOpExecutorHandle,
) -> i32;

type GroupedMatMulGetWorkspaceSizeFn = unsafe extern "C" fn(
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    *mut u64,
    *mut AclOpExecutorHandle,
) -> i32;

type AddRmsNormGetWorkspaceSizeFn = unsafe extern "C" fn(
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    *mut u64,
    *mut AclOpExecutorHandle,
) -> i32;

type ReshapeAndCacheGetWorkspaceSizeFn = unsafe extern "C" fn(
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    *mut u64,
    *mut AclOpExecutorHandle,
) -> i32;

type PagedAttentionGetWorkspaceSizeFn = unsafe extern "C" fn(
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    AclTensorHandle,
    *mut u64,
    *mut AclOpExecutorHandle,
) -> i32;

/// Shared execute signature: `(workspace, workspaceSize, executor, stream)`.
type AclnnExecuteFn =
    unsafe extern "C" fn(*mut c_void, u64, AclOpExecutorHandle, AclrtStream) -> i32;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedRuntimeConfig {
    acl_library: PathBuf,
    opapi_library: PathBuf,
    ops_library: PathBuf,
}

/// Where the three shared libraries are found. Builder overrides win over
/// `ASCEND_OPS_RS_*` environment variables, which win over the default
/// sonames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub acl_library: Option<PathBuf>,
    pub opapi_library: Option<PathBuf>,
    pub ops_library: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, AscendOpsError> {
        Ok(Self {
            acl_library: env_path(ENV_ACL_LIBRARY)?,
            opapi_library: env_path(ENV_OPAPI_LIBRARY)?,
            ops_library: env_path(ENV_OPS_LIBRARY)?,
        })
    }

    pub fn with_acl_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.acl_library = Some(path.into());
        self
    }

    pub fn with_opapi_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.opapi_library = Some(path.into());
        self
    }

    pub fn with_ops_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.ops_library = Some(path.into());
        self
    }

    fn resolve(&self) -> Result<ResolvedRuntimeConfig, AscendOpsError> {
        let env_cfg = RuntimeConfig::from_env()?;

        Ok(ResolvedRuntimeConfig {
            acl_library: self
                .acl_library
                .clone()
                .or(env_cfg.acl_library)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ACL_LIBRARY)),
            opapi_library: self
                .opapi_library
                .clone()
                .or(env_cfg.opapi_library)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OPAPI_LIBRARY)),
            ops_library: self
                .ops_library
                .clone()
                .or(env_cfg.ops_library)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OPS_LIBRARY)),
        })
    }
}

/// Process-global handle to the loaded kernel libraries. Symbols are
/// resolved eagerly at load so a missing kernel fails at initialization,
/// not mid-inference.
pub struct AscendOpsRuntime {
    resolved: ResolvedRuntimeConfig,
    _acl_lib: Library,
    _opapi_lib: Library,
    _ops_lib: Library,
    acl_get_recent_err_msg: AclGetRecentErrMsgFn,
    acl_create_tensor: AclCreateTensorFn,
    acl_destroy_tensor: AclDestroyTensorFn,
    swiglu_get_workspace_size: SwiGluGetWorkspaceSizeFn,
    swiglu_execute: AclnnExecuteFn,
    matmul_get_workspace_size: MatMulGetWorkspaceSizeFn,
    matmul_execute: AclnnExecuteFn,
    grouped_matmul_get_workspace_size: GroupedMatMulGetWorkspaceSizeFn,
    grouped_matmul_execute: AclnnExecuteFn,
    add_rms_norm_get_workspace_size: AddRmsNormGetWorkspaceSizeFn,
    add_rms_norm_execute: AclnnExecuteFn,
    reshape_and_cache_get_workspace_size: ReshapeAndCacheGetWorkspaceSizeFn,
    reshape_and_cache_execute: AclnnExecuteFn,
    paged_attention_get_workspace_size: PagedAttentionGetWorkspaceSizeFn,
    paged_attention_execute: AclnnExecuteFn,
}

static GLOBAL_RUNTIME: OnceLock<AscendOpsRuntime> = OnceLock::new();
static RUNTIME_INIT_LOCK: Mutex<()> = Mutex::new(());

impl AscendOpsRuntime {
    pub fn initialize(config: RuntimeConfig) -> Result<&'static Self, AscendOpsError> {
        let resolved = config.resolve()?;

        // A poisoned init lock means a concurrent initialization panicked;
        // the runtime state is unknown, so refuse to initialize again.
        let _init_guard = RUNTIME_INIT_LOCK
            .lock()
            .map_err(|_| AscendOpsError::RuntimeAlreadyInitialized)?;

        if let Some(runtime) = GLOBAL_RUNTIME.get() {
            if runtime.resolved == resolved {
                return Ok(runtime);
            }
            return Err(AscendOpsError::RuntimeAlreadyInitialized);
        }

        // SAFETY: dynamic loading and symbol resolution are encapsulated
        // and validated below.
        let runtime = unsafe { Self::load(resolved)? };
        let _ = GLOBAL_RUNTIME.set(runtime);
        GLOBAL_RUNTIME
            .get()
            .ok_or(AscendOpsError::RuntimeAlreadyInitialized)
    }

    pub fn global() -> Result<&'static Self, AscendOpsError> {
        Self::initialize(RuntimeConfig::default())
    }

    unsafe fn load(resolved: ResolvedRuntimeConfig) -> Result<Self, AscendOpsError> {
        // libascendcl must be global: the op library resolves its runtime
        // symbols against it at load time.
        let acl_lib = unsafe {
            Library::open(
                Some(&resolved.acl_library),
                libc::RTLD_NOW | libc::RTLD_GLOBAL,
            )
        }
        .map_err(|e| AscendOpsError::LibraryLoad {
            library: resolved.acl_library.clone(),
            message: e.to_string(),
        })?;

        let opapi_lib = unsafe {
            Library::open(
                Some(&resolved.opapi_library),
                libc::RTLD_NOW | libc::RTLD_GLOBAL,
            )
        }
        .map_err(|e| AscendOpsError::LibraryLoad {
            library: resolved.opapi_library.clone(),
            message: e.to_string(),
        })?;

        let ops_lib = unsafe {
            Library::open(
                Some(&resolved.ops_library),
                libc::RTLD_NOW | libc::RTLD_LOCAL,
            )
        }
        .map_err(|e| AscendOpsError::LibraryLoad {
            library: resolved.ops_library.clone(),
            message: e.to_string(),
        })?;

        let acl_get_recent_err_msg: AclGetRecentErrMsgFn = unsafe {
            resolve_symbol(
                &acl_lib,
                &resolved.acl_library,
                b"aclGetRecentErrMsg\0",
                "aclGetRecentErrMsg",
            )?
        };

        let acl_create_tensor: AclCreateTensorFn = unsafe {
            resolve_symbol(
                &opapi_lib,
                &resolved.opapi_library,
                b"aclCreateTensor\0",
                "aclCreateTensor",
            )?
        };

        let acl_destroy_tensor: AclDestroyTensorFn = unsafe {
            resolve_symbol(
                &opapi_lib,
                &resolved.opapi_library,
                b"aclDestroyTensor\0",
                "aclDestroyTensor",
            )?
        };

        let swiglu_get_workspace_size: SwiGluGetWorkspaceSizeFn = unsafe {
            resolve_symbol(
                &ops_lib,
                &resolved.ops_library,
                b"aclnnSwiGluExGetWorkspaceSize\0",
                "aclnnSwiGluExGetWorkspaceSize",
            )?
        };

        let swiglu_execute: AclnnExecuteFn = unsafe {
            resolve_symbol(
                &ops_lib,
                &resolved.ops_library,
                b"aclnnSwiGluEx\0",
                "aclnnSwiGluEx",
            )?
        };

        let matmul_get_workspace_size: MatMulGetWorkspaceSizeFn = unsafe {
            resolve_symbol(
                &ops_lib,
                &resolved.ops_library,
                b"aclnnMatMulExGetWorkspaceSize\0",
                "aclnnMatMulExGetWorkspaceSize",
            )?
        };

        let matmul_execute: AclnnExecuteFn = unsafe {
            resolve_symbol(
                &ops_lib,
                &resolved.ops_library,
                b"aclnnMatMulEx\0",
                "aclnnMatMulEx",
            )?
        };

        let grouped_matmul_get_workspace_size: GroupedMatMulGetWorkspaceSizeFn = unsafe {
            resolve_symbol(
                &ops_lib,
                &resolved.ops_library,
                b"aclnnGroupedMatMulExGetWorkspaceSize\0",
                "aclnnGroupedMatMulExGetWorkspaceSize",
            )?
        };

        let grouped_matmul_execute: AclnnExecuteFn = unsafe {
            resolve_symbol(
                &ops_lib,
                &resolved.ops_library,
                b"aclnnGroupedMatMulEx\0",
                "aclnnGroupedMatMulEx",
            )?
        };

        let add_rms_norm_get_workspace_size: AddRmsNormGetWorkspaceSizeFn = unsafe {
            resolve_symbol(
                &ops_lib,
                &resolved.ops_library,
                b"aclnnAddRMSNormExGetWorkspaceSize\0",
                "aclnnAddRMSNormExGetWorkspaceSize",
            )?
        };

        let add_rms_norm_execute: AclnnExecuteFn = unsafe {
            resolve_symbol(
                &ops_lib,
                &resolved.ops_library,
                b"aclnnAddRMSNormEx\0",
                "aclnnAddRMSNormEx",
            )?
        };

        let reshape_and_cache_get_workspace_size: ReshapeAndCacheGetWorkspaceSizeFn = unsafe {
            resolve_symbol(
                &ops_lib,
                &resolved.ops_library,
                b"aclnnReshapeAndCacheExGetWorkspaceSize\0",
                "aclnnReshapeAndCacheExGetWorkspaceSize",
            )?
        };

        let reshape_and_cache_execute: AclnnExecuteFn = unsafe {
            resolve_symbol(
                &ops_lib,
                &resolved.ops_library,
                b"aclnnReshapeAndCacheEx\0",
                "aclnnReshapeAndCacheEx",
            )?
        };

        let paged_attention_get_workspace_size: PagedAttentionGetWorkspaceSizeFn = unsafe {
            resolve_symbol(
                &ops_lib,
                &resolved.ops_library,
                b"aclnnPagedAttentionExGetWorkspaceSize\0",
                "aclnnPagedAttentionExGetWorkspaceSize",
            )?
        };

        let paged_attention_execute: AclnnExecuteFn = unsafe {
            resolve_symbol(
                &ops_lib,
                &resolved.ops_library,
                b"aclnnPagedAttentionEx\0",
                "aclnnPagedAttentionEx",
            )?
        };

        debug!(
            "loaded Ascend kernel libraries: acl={}, opapi={}, ops={}",
            resolved.acl_library.display(),
            resolved.opapi_library.display(),
            resolved.ops_library.display()
        );

        Ok(Self {
            resolved,
            _acl_lib: acl_lib,
            _opapi_lib: opapi_lib,
            _ops_lib: ops_lib,
            acl_get_recent_err_msg,
            acl_create_tensor,
            acl_destroy_tensor,
            swiglu_get_workspace_size,
            swiglu_execute,
            matmul_get_workspace_size,
            matmul_execute,
            grouped_matmul_get_workspace_size,
            grouped_matmul_execute,
            add_rms_norm_get_workspace_size,
            add_rms_norm_execute,
            reshape_and_cache_get_workspace_size,
            reshape_and_cache_execute,
            paged_attention_get_workspace_size,
            paged_attention_execute,
        })
    }

    fn recent_error_message(&self) -> String {
        // SAFETY: symbol resolved from the ACL C ABI; null is handled.
        unsafe { ffi::recent_err_msg_to_string((self.acl_get_recent_err_msg)()) }
    }

    fn kernel_status(
        &self,
        op: &'static str,
        phase: KernelPhase,
        code: i32,
    ) -> Result<(), AscendOpsError> {
        if code == ffi::ACL_SUCCESS {
            return Ok(());
        }
        Err(AscendOpsError::kernel_execution(
            op,
            phase,
            code,
            self.recent_error_message(),
        ))
    }

    pub(crate) unsafe fn swiglu_workspace_size(
        &self,
        x: AclTensorHandle,
        y: AclTensorHandle,
    ) -> Result<(u64, AclOpExecutorHandle), AscendOpsError> {
        let mut workspace_size = 0_u64;
        let mut executor: AclOpExecutorHandle = std::ptr::null_mut();
        // SAFETY: handles come from aclCreateTensor and outlive the call.
        let code = unsafe {
            (self.swiglu_get_workspace_size)(x, y, &mut workspace_size, &mut executor)
        };
        self.kernel_status("swiglu", KernelPhase::SizeQuery, code)?;
        Ok((workspace_size, executor))
    }

    pub(crate) unsafe fn swiglu_launch(
        &self,
        workspace: *mut c_void,
        workspace_size: u64,
        executor: AclOpExecutorHandle,
        stream: AclrtStream,
    ) -> Result<(), AscendOpsError> {
        // SAFETY: executor comes from the matching size query.
        let code = unsafe { (self.swiglu_execute)(workspace, workspace_size, executor, stream) };
        self.kernel_status("swiglu", KernelPhase::Execute, code)
    }

    pub(crate) unsafe fn matmul_workspace_size(
        &self,
        x: AclTensorHandle,
        weight: AclTensorHandle,
        y: AclTensorHandle,
    ) -> Result<(u64, AclOpExecutorHandle), AscendOpsError> {
        let mut workspace_size = 0_u64;
        let mut executor: AclOpExecutorHandle = std::ptr::null_mut();
        // SAFETY: handles come from aclCreateTensor and outlive the call.
        let code = unsafe {
            (self.matmul_get_workspace_size)(x, weight, y, &mut workspace_size, &mut executor)
        };
        self.kernel_status("matmul", KernelPhase::SizeQuery, code)?;
        Ok((workspace_size, executor))
    }

    pub(crate) unsafe fn matmul_launch(
        &self,
        workspace: *mut c_void,
        workspace_size: u64,
        executor: AclOpExecutorHandle,
        stream: AclrtStream,
    ) -> Result<(), AscendOpsError> {
        // SAFETY: executor comes from the matching size query.
        let code = unsafe { (self.matmul_execute)(workspace, workspace_size, executor, stream) };
        self.kernel_status("matmul", KernelPhase::Execute, code)
    }

    pub(crate) unsafe fn grouped_matmul_workspace_size(
        &self,
        x: AclTensorHandle,
        weight: AclTensorHandle,
        group_list: AclTensorHandle,
        y: AclTensorHandle,
    ) -> Result<(u64, AclOpExecutorHandle), AscendOpsError> {
        let mut workspace_size = 0_u64;
        let mut executor: AclOpExecutorHandle = std::ptr::null_mut();
        // SAFETY: handles come from aclCreateTensor and outlive the call.
        let code = unsafe {
            (self.grouped_matmul_get_workspace_size)(
                x,
                weight,
                group_list,
                y,
                &mut workspace_size,
                &mut executor,
            )
        };
        self.kernel_status("grouped_matmul", KernelPhase::SizeQuery, code)?;
        Ok((workspace_size, executor))
    }

    pub(crate) unsafe fn grouped_matmul_launch(
        &self,
        workspace: *mut c_void,
        workspace_size: u64,
        executor: AclOpExecutorHandle,
        stream: AclrtStream,
    ) -> Result<(), AscendOpsError> {
        // SAFETY: executor comes from the matching size query.
        let code =
            unsafe { (self.grouped_matmul_execute)(workspace, workspace_size, executor, stream) };
        self.kernel_status("grouped_matmul", KernelPhase::Execute, code)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn add_rms_norm_workspace_size(
        &self,
        x: AclTensorHandle,
        residual: AclTensorHandle,
        weight: AclTensorHandle,
        epsilon: AclTensorHandle,
        y: AclTensorHandle,
        residual_output: AclTensorHandle,
    ) -> Result<(u64, AclOpExecutorHandle), AscendOpsError> {
        let mut workspace_size = 0_u64;
        let mut executor: AclOpExecutorHandle = std::ptr::null_mut();
        // SAFETY: handles come from aclCreateTensor and outlive the call.
        let code = unsafe {
            (self.add_rms_norm_get_workspace_size)(
                x,
                residual,
                weight,
                epsilon,
                y,
                residual_output,
                &mut workspace_size,
                &mut executor,
            )
        };
        self.kernel_status("add_rms_norm", KernelPhase::SizeQuery, code)?;
        Ok((workspace_size, executor))
    }

    pub(crate) unsafe fn add_rms_norm_launch(
        &self,
        workspace: *mut c_void,
        workspace_size: u64,
        executor: AclOpExecutorHandle,
        stream: AclrtStream,
    ) -> Result<(), AscendOpsError> {
        // SAFETY: executor comes from the matching size query.
        let code =
            unsafe { (self.add_rms_norm_execute)(workspace, workspace_size, executor, stream) };
        self.kernel_status("add_rms_norm", KernelPhase::Execute, code)
    }

    pub(crate) unsafe fn reshape_and_cache_workspace_size(
        &self,
        key: AclTensorHandle,
        value: Option<AclTensorHandle>,
        key_cache: AclTensorHandle,
        value_cache: Option<AclTensorHandle>,
        slot_indices: AclTensorHandle,
    ) -> Result<(u64, AclOpExecutorHandle), AscendOpsError> {
        let mut workspace_size = 0_u64;
        let mut executor: AclOpExecutorHandle = std::ptr::null_mut();
        // SAFETY: handles come from aclCreateTensor and outlive the call;
        // the kernel accepts null for the optional value operands.
        let code = unsafe {
            (self.reshape_and_cache_get_workspace_size)(
                key,
                value.unwrap_or(std::ptr::null_mut()),
                key_cache,
                value_cache.unwrap_or(std::ptr::null_mut()),
                slot_indices,
                &mut workspace_size,
                &mut executor,
            )
        };
        self.kernel_status("reshape_and_cache", KernelPhase::SizeQuery, code)?;
        Ok((workspace_size, executor))
    }

    pub(crate) unsafe fn reshape_and_cache_launch(
        &self,
        workspace: *mut c_void,
        workspace_size: u64,
        executor: AclOpExecutorHandle,
        stream: AclrtStream,
    ) -> Result<(), AscendOpsError> {
        // SAFETY: executor comes from the matching size query.
        let code = unsafe {
            (self.reshape_and_cache_execute)(workspace, workspace_size, executor, stream)
        };
        self.kernel_status("reshape_and_cache", KernelPhase::Execute, code)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn paged_attention_workspace_size(
        &self,
        query: AclTensorHandle,
        key_cache: AclTensorHandle,
        value_cache: AclTensorHandle,
        block_tables: AclTensorHandle,
        context_lens: AclTensorHandle,
        y: AclTensorHandle,
    ) -> Result<(u64, AclOpExecutorHandle), AscendOpsError> {
        let mut workspace_size = 0_u64;
        let mut executor: AclOpExecutorHandle = std::ptr::null_mut();
        // SAFETY: handles come from aclCreateTensor and outlive the call.
        let code = unsafe {
            (self.paged_attention_get_workspace_size)(
                query,
                key_cache,
                value_cache,
                block_tables,
                context_lens,
                y,
                &mut workspace_size,
                &mut executor,
            )
        };
        self.kernel_status("paged_attention", KernelPhase::SizeQuery, code)?;
        Ok((workspace_size, executor))
    }

    pub(crate) unsafe fn paged_attention_launch(
        &self,
        workspace: *mut c_void,
        workspace_size: u64,
        executor: AclOpExecutorHandle,
        stream: AclrtStream,
    ) -> Result<(), AscendOpsError> {
        // SAFETY: executor comes from the matching size query.
        let code =
            unsafe { (self.paged_attention_execute)(workspace, workspace_size, executor, stream) };
        self.kernel_status("paged_attention", KernelPhase::Execute, code)
    }
}

impl DescriptorHost for AscendOpsRuntime {
    unsafe fn create_tensor(&self, spec: &TensorSpec<'_>) -> AclTensorHandle {
        // SAFETY: spec arrays outlive the call; aclCreateTensor copies the
        // metadata into the returned handle.
        unsafe {
            (self.acl_create_tensor)(
                spec.dims.as_ptr(),
                spec.dims.len() as u64,
                spec.dtype,
                spec.strides.as_ptr(),
                0,
                ffi::ACL_FORMAT_ND,
                spec.dims.as_ptr(),
                spec.dims.len() as u64,
                spec.data,
            )
        }
    }

    unsafe fn destroy_tensor(&self, handle: AclTensorHandle) -> i32 {
        // SAFETY: handle came from aclCreateTensor and is destroyed once.
        unsafe { (self.acl_destroy_tensor)(handle) }
    }
}

unsafe fn resolve_symbol<T: Copy>(
    lib: &Library,
    library: &Path,
    symbol_bytes: &'static [u8],
    symbol_name: &'static str,
) -> Result<T, AscendOpsError> {
    // SAFETY: caller provides the concrete symbol type and this function
    // only copies fn ptr values.
    let symbol =
        unsafe { lib.get::<T>(symbol_bytes) }.map_err(|e| AscendOpsError::SymbolResolve {
            library: library.to_path_buf(),
            symbol: symbol_name,
            message: e.to_string(),
        })?;
    Ok(*symbol)
}

fn env_path(name: &'static str) -> Result<Option<PathBuf>, AscendOpsError> {
    let Some(value) = env::var_os(name) else {
        return Ok(None);
    };

    if value.is_empty() {
        return Err(AscendOpsError::InvalidEnvironment {
            name,
            message: "value is empty".to_string(),
        });
    }

    Ok(Some(PathBuf::from(value)))
}
