use std::ffi::c_void;

use crate::context::ExecutionContext;
use crate::descriptor::{DType, DescriptorSet, TensorSpec};
use crate::error::AscendOpsError;
use crate::ffi::{self, AclTensorHandle};
use crate::grouped_matmul::Tensor3DDesc;
use crate::runtime::AscendOpsRuntime;
use crate::validate::{check_contiguous_1d, check_contiguous_3d, check_contiguous_4d, check_non_null};

const OP: &str = "reshape_and_cache";

/// Borrowed rank-4 device tensor.
#[derive(Debug, Clone, Copy)]
pub struct Tensor4DDesc {
    pub ptr: *const c_void,
    pub dim0: i64,
    pub dim1: i64,
    pub dim2: i64,
    pub dim3: i64,
    pub stride0: i64,
    pub stride1: i64,
    pub stride2: i64,
    pub stride3: i64,
    pub dtype: DType,
    pub device_id: i32,
}

/// Borrowed rank-1 int32 device tensor.
#[derive(Debug, Clone, Copy)]
pub struct Tensor1DI32Desc {
    pub ptr: *const c_void,
    pub len: i64,
    pub stride: i64,
    pub device_id: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct ReshapeAndCacheParams {
    /// Keys to write, rank-3: `[num_tokens, num_kv_heads, head_dim]`.
    pub key: Tensor3DDesc,
    /// Values to write; absent for key-only cache updates.
    pub value: Option<Tensor3DDesc>,
    /// Paged key cache, rank-4:
    /// `[num_pages, channels_per_page, page_size, 16]`.
    pub key_cache: Tensor4DDesc,
    /// Paged value cache; absent together with `value`.
    pub value_cache: Option<Tensor4DDesc>,
    /// Flat physical slot per token (`page * page_size + offset`), rank-1
    /// int32: `[num_tokens]`. Slot values live on the device and must be
    /// in range; out-of-range slots are undefined behavior at the kernel
    /// level and are the caller's responsibility.
    pub slot_indices: Tensor1DI32Desc,
}

impl ReshapeAndCacheParams {
    pub fn new(
        key: Tensor3DDesc,
        value: Option<Tensor3DDesc>,
        key_cache: Tensor4DDesc,
        value_cache: Option<Tensor4DDesc>,
        slot_indices: Tensor1DI32Desc,
    ) -> Self {
        Self {
            key,
            value,
            key_cache,
            value_cache,
            slot_indices,
        }
    }

    pub fn validate(&self) -> Result<(), AscendOpsError> {
        check_non_null(OP, "key", self.key.ptr)?;
        check_non_null(OP, "key_cache", self.key_cache.ptr)?;
        check_non_null(OP, "slot_indices", self.slot_indices.ptr)?;
        check_contiguous_3d(
            OP,
            "key",
            [self.key.dim0, self.key.dim1, self.key.dim2],
            [self.key.stride0, self.key.stride1, self.key.stride2],
        )?;
        check_contiguous_4d(
            OP,
            "key_cache",
            [
                self.key_cache.dim0,
                self.key_cache.dim1,
                self.key_cache.dim2,
                self.key_cache.dim3,
            ],
            [
                self.key_cache.stride0,
                self.key_cache.stride1,
                self.key_cache.stride2,
                self.key_cache.stride3,
            ],
        )?;
        check_contiguous_1d(OP, "slot_indices", self.slot_indices.len, self.slot_indices.stride)?;

        if self.slot_indices.len != self.key.dim0 {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "slot_indices",
                format!("one slot per token ({})", self.key.dim0),
                self.slot_indices.len.to_string(),
            ));
        }
        if self.key.dtype != self.key_cache.dtype {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "key_cache",
                format!("dtype matching key ({:?})", self.key.dtype),
                format!("{:?}", self.key_cache.dtype),
            ));
        }

        if let Some(value) = &self.value {
            check_non_null(OP, "value", value.ptr)?;
            check_contiguous_3d(
                OP,
                "value",
                [value.dim0, value.dim1, value.dim2],
                [value.stride0, value.stride1, value.stride2],
            )?;
            if value.dim0 != self.key.dim0
                || value.dim1 != self.key.dim1
                || value.dim2 != self.key.dim2
            {
                return Err(AscendOpsError::invalid_argument(
                    OP,
                    "value",
                    format!(
                        "shape matching key ([{}, {}, {}])",
                        self.key.dim0, self.key.dim1, self.key.dim2
                    ),
                    format!("[{}, {}, {}]", value.dim0, value.dim1, value.dim2),
                ));
            }
            if value.dtype != self.key.dtype {
                return Err(AscendOpsError::invalid_argument(
                    OP,
                    "value",
                    format!("dtype matching key ({:?})", self.key.dtype),
                    format!("{:?}", value.dtype),
                ));
            }
        }

        if let Some(value_cache) = &self.value_cache {
            check_non_null(OP, "value_cache", value_cache.ptr)?;
            check_contiguous_4d(
                OP,
                "value_cache",
                [
                    value_cache.dim0,
                    value_cache.dim1,
                    value_cache.dim2,
                    value_cache.dim3,
                ],
                [
                    value_cache.stride0,
                    value_cache.stride1,
                    value_cache.stride2,
                    value_cache.stride3,
                ],
            )?;
            if value_cache.dtype != self.key.dtype {
                return Err(AscendOpsError::invalid_argument(
                    OP,
                    "value_cache",
                    format!("dtype matching key ({:?})", self.key.dtype),
                    format!("{:?}", value_cache.dtype),
                ));
            }
            if value_cache.dim0 != self.key_cache.dim0
                || value_cache.dim1 != self.key_cache.dim1
                || value_cache.dim2 != self.key_cache.dim2
                || value_cache.dim3 != self.key_cache.dim3
            {
                return Err(AscendOpsError::invalid_argument(
                    OP,
                    "value_cache",
                    "extents matching key_cache".to_string(),
                    format!(
                        "[{}, {}, {}, {}]",
                        value_cache.dim0, value_cache.dim1, value_cache.dim2, value_cache.dim3
                    ),
                ));
            }
        }

        let device_id = self.key.device_id;
        let mut same_device = self.key_cache.device_id == device_id
            && self.slot_indices.device_id == device_id;
        if let Some(value) = &self.value {
            same_device &= value.device_id == device_id;
        }
        if let Some(value_cache) = &self.value_cache {
            same_device &= value_cache.device_id == device_id;
        }
        if !same_device {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "key",
                format!("all tensors on device {device_id}"),
                "a mixed-device operand set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scatter per-token key/value vectors into the paged caches at the given
/// physical slots. Mutates the caches in place; nothing is returned.
pub fn reshape_and_cache(
    ctx: &ExecutionContext<'_>,
    params: &ReshapeAndCacheParams,
) -> Result<(), AscendOpsError> {
    params.validate()?;
    ctx.ensure_same_device(OP, "key", params.key.device_id)?;
    let runtime = AscendOpsRuntime::global()?;
    // SAFETY: all FFI preconditions are validated above and by runtime
    // initialization.
    unsafe { reshape_and_cache_with_runtime(runtime, ctx, params) }
}

unsafe fn reshape_and_cache_with_runtime(
    runtime: &AscendOpsRuntime,
    ctx: &ExecutionContext<'_>,
    params: &ReshapeAndCacheParams,
) -> Result<(), AscendOpsError> {
    let key = params.key;
    let key_dims = [key.dim0, key.dim1, key.dim2];
    let key_strides = [key.stride0, key.stride1, key.stride2];
    let key_cache = params.key_cache;
    let key_cache_dims = [
        key_cache.dim0,
        key_cache.dim1,
        key_cache.dim2,
        key_cache.dim3,
    ];
    let key_cache_strides = [
        key_cache.stride0,
        key_cache.stride1,
        key_cache.stride2,
        key_cache.stride3,
    ];
    let slot_dims = [params.slot_indices.len];
    let slot_strides = [params.slot_indices.stride];

    let mut descriptors = DescriptorSet::new(runtime, OP);
    let key_acl = descriptors.create(
        "key",
        &TensorSpec::new(
            &key_dims,
            &key_strides,
            key.dtype.as_acl_dtype(),
            key.ptr.cast_mut(),
        ),
    )?;

    let value_acl: Option<AclTensorHandle> = match &params.value {
        Some(value) => {
            let value_dims = [value.dim0, value.dim1, value.dim2];
            let value_strides = [value.stride0, value.stride1, value.stride2];
            Some(descriptors.create(
                "value",
                &TensorSpec::new(
                    &value_dims,
                    &value_strides,
                    value.dtype.as_acl_dtype(),
                    value.ptr.cast_mut(),
                ),
            )?)
        }
        None => None,
    };

    let key_cache_acl = descriptors.create(
        "key_cache",
        &TensorSpec::new(
            &key_cache_dims,
            &key_cache_strides,
            key_cache.dtype.as_acl_dtype(),
            key_cache.ptr.cast_mut(),
        ),
    )?;

    let value_cache_acl: Option<AclTensorHandle> = match &params.value_cache {
        Some(value_cache) => {
            let value_cache_dims = [
                value_cache.dim0,
                value_cache.dim1,
                value_cache.dim2,
                value_cache.dim3,
            ];
            let value_cache_strides = [
                value_cache.stride0,
                value_cache.stride1,
                value_cache.stride2,
                value_cache.stride3,
            ];
            Some(descriptors.create(
                "value_cache",
                &TensorSpec::new(
                    &value_cache_dims,
                    &value_cache_strides,
                    value_cache.dtype.as_acl_dtype(),
                    value_cache.ptr.cast_mut(),
                ),
            )?)
        }
        None => None,
    };

    let slot_indices_acl = descriptors.create(
        "slot_indices",
        &TensorSpec::new(
            &slot_dims,
            &slot_strides,
            ffi::ACL_INT32,
            params.slot_indices.ptr.cast_mut(),
        ),
    )?;

    // SAFETY: descriptor handles are live until `finish`.
    let (workspace_size, executor) = unsafe {
        runtime.reshape_and_cache_workspace_size(
            key_acl,
            value_acl,
            key_cache_acl,
            value_cache_acl,
            slot_indices_acl,
        )?
    };
    let workspace = ctx.allocate_workspace(OP, workspace_size)?;
    // SAFETY: executor pairs with the size query above.
    let launch_result = unsafe {
        runtime.reshape_and_cache_launch(
            workspace.device_ptr(),
            workspace.size(),
            executor,
            ctx.stream(),
        )
    };
    let teardown_result = descriptors.finish();

    match (launch_result, teardown_result) {
        (Err(launch_error), _) => Err(launch_error),
        (Ok(()), Err(teardown_error)) => Err(teardown_error),
        (Ok(()), Ok(())) => Ok(()),
    }
}
