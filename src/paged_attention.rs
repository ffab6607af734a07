use std::ffi::c_void;

use log::debug;

use crate::context::{DeviceTensor, ExecutionContext};
use crate::descriptor::{DescriptorSet, TensorSpec};
use crate::error::AscendOpsError;
use crate::ffi;
use crate::grouped_matmul::Tensor3DDesc;
use crate::reshape_and_cache::{Tensor1DI32Desc, Tensor4DDesc};
use crate::runtime::AscendOpsRuntime;
use crate::validate::{
    check_contiguous_1d, check_contiguous_3d, check_contiguous_4d, check_non_null,
};

const OP: &str = "paged_attention";

/// Elements packed into the trailing cache sub-block.
const SUB_BLOCK_ELEMS: i64 = 16;

/// Borrowed rank-2 int32 device tensor.
#[derive(Debug, Clone, Copy)]
pub struct Tensor2DI32Desc {
    pub ptr: *const c_void,
    pub rows: i64,
    pub cols: i64,
    pub stride_row: i64,
    pub stride_col: i64,
    pub device_id: i32,
}

/// Physical cache geometry derived from the key-cache extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeometry {
    pub num_pages: i64,
    pub num_kv_heads: i64,
    pub page_size: i64,
}

impl CacheGeometry {
    /// Derive `(num_pages, num_kv_heads, page_size)` from a cache laid out
    /// as `[num_pages, num_kv_heads * head_dim / 16, page_size, 16]`.
    /// Consistency with the query's head dimension is an explicit
    /// precondition, not silent trust.
    pub fn derive(key_cache: &Tensor4DDesc, head_dim: i64) -> Result<Self, AscendOpsError> {
        if key_cache.dim3 != SUB_BLOCK_ELEMS {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "key_cache",
                format!("a trailing sub-block of {SUB_BLOCK_ELEMS} elements"),
                key_cache.dim3.to_string(),
            ));
        }
        let packed_channels = key_cache.dim1 * SUB_BLOCK_ELEMS;
        if head_dim <= 0 || packed_channels % head_dim != 0 {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "key_cache",
                format!(
                    "per-page channels * {SUB_BLOCK_ELEMS} divisible by the query head dimension ({head_dim})"
                ),
                packed_channels.to_string(),
            ));
        }
        Ok(Self {
            num_pages: key_cache.dim0,
            num_kv_heads: packed_channels / head_dim,
            page_size: key_cache.dim2,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PagedAttentionParams {
    /// Decode-step queries, rank-3: `[batch, num_heads, head_dim]`.
    pub query: Tensor3DDesc,
    /// Paged key cache, rank-4:
    /// `[num_pages, num_kv_heads * head_dim / 16, page_size, 16]`.
    pub key_cache: Tensor4DDesc,
    /// Paged value cache, same extents as `key_cache`.
    pub value_cache: Tensor4DDesc,
    /// Ordered page indices per sequence, rank-2 int32:
    /// `[batch, max_pages_per_seq]`. Page index values live on the device
    /// and are the caller's responsibility.
    pub block_tables: Tensor2DI32Desc,
    /// Valid token count per sequence, rank-1 int32: `[batch]`.
    pub context_lens: Tensor1DI32Desc,
}

impl PagedAttentionParams {
    pub fn new(
        query: Tensor3DDesc,
        key_cache: Tensor4DDesc,
        value_cache: Tensor4DDesc,
        block_tables: Tensor2DI32Desc,
        context_lens: Tensor1DI32Desc,
    ) -> Self {
        Self {
            query,
            key_cache,
            value_cache,
            block_tables,
            context_lens,
        }
    }

    /// Geometry as the kernel will see it.
    pub fn geometry(&self) -> Result<CacheGeometry, AscendOpsError> {
        CacheGeometry::derive(&self.key_cache, self.query.dim2)
    }

    pub fn validate(&self) -> Result<(), AscendOpsError> {
        check_non_null(OP, "query", self.query.ptr)?;
        check_non_null(OP, "key_cache", self.key_cache.ptr)?;
        check_non_null(OP, "value_cache", self.value_cache.ptr)?;
        check_non_null(OP, "block_tables", self.block_tables.ptr)?;
        check_non_null(OP, "context_lens", self.context_lens.ptr)?;
        check_contiguous_3d(
            OP,
            "query",
            [self.query.dim0, self.query.dim1, self.query.dim2],
            [self.query.stride0, self.query.stride1, self.query.stride2],
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
        check_contiguous_4d(
            OP,
            "value_cache",
            [
                self.value_cache.dim0,
                self.value_cache.dim1,
                self.value_cache.dim2,
                self.value_cache.dim3,
            ],
            [
                self.value_cache.stride0,
                self.value_cache.stride1,
                self.value_cache.stride2,
                self.value_cache.stride3,
            ],
        )?;
        check_contiguous_1d(OP, "context_lens", self.context_lens.len, self.context_lens.stride)?;

        if self.block_tables.rows <= 0 || self.block_tables.cols <= 0 {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "block_tables",
                "positive extents",
                format!("[{}, {}]", self.block_tables.rows, self.block_tables.cols),
            ));
        }
        if self.block_tables.stride_col != 1
            || self.block_tables.stride_row != self.block_tables.cols
        {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "block_tables",
                format!(
                    "a contiguous row-major layout (strides [{}, 1])",
                    self.block_tables.cols
                ),
                format!(
                    "strides [{}, {}]",
                    self.block_tables.stride_row, self.block_tables.stride_col
                ),
            ));
        }

        if self.value_cache.dim0 != self.key_cache.dim0
            || self.value_cache.dim1 != self.key_cache.dim1
            || self.value_cache.dim2 != self.key_cache.dim2
            || self.value_cache.dim3 != self.key_cache.dim3
        {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "value_cache",
                "extents matching key_cache".to_string(),
                format!(
                    "[{}, {}, {}, {}]",
                    self.value_cache.dim0,
                    self.value_cache.dim1,
                    self.value_cache.dim2,
                    self.value_cache.dim3
                ),
            ));
        }

        let geometry = self.geometry()?;
        if self.query.dim1 % geometry.num_kv_heads != 0 {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "query",
                format!(
                    "head count divisible by the cache KV head count ({})",
                    geometry.num_kv_heads
                ),
                self.query.dim1.to_string(),
            ));
        }

        let batch = self.query.dim0;
        if self.block_tables.rows != batch {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "block_tables",
                format!("one page list per sequence ({batch})"),
                self.block_tables.rows.to_string(),
            ));
        }
        if self.context_lens.len != batch {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "context_lens",
                format!("one length per sequence ({batch})"),
                self.context_lens.len.to_string(),
            ));
        }

        if self.query.dtype != self.key_cache.dtype || self.query.dtype != self.value_cache.dtype {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "key_cache",
                format!("dtype matching query ({:?})", self.query.dtype),
                "a mixed-dtype operand set".to_string(),
            ));
        }

        let device_id = self.query.device_id;
        if self.key_cache.device_id != device_id
            || self.value_cache.device_id != device_id
            || self.block_tables.device_id != device_id
            || self.context_lens.device_id != device_id
        {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "query",
                format!("all tensors on device {device_id}"),
                "a mixed-device operand set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Decode-step attention over the paged KV cache. Returns a fresh tensor
/// with the query's shape `[batch, num_heads, head_dim]`.
pub fn paged_attention(
    ctx: &ExecutionContext<'_>,
    params: &PagedAttentionParams,
) -> Result<DeviceTensor, AscendOpsError> {
    params.validate()?;
    ctx.ensure_same_device(OP, "query", params.query.device_id)?;
    let runtime = AscendOpsRuntime::global()?;
    // SAFETY: all FFI preconditions are validated above and by runtime
    // initialization.
    unsafe { paged_attention_with_runtime(runtime, ctx, params) }
}

unsafe fn paged_attention_with_runtime(
    runtime: &AscendOpsRuntime,
    ctx: &ExecutionContext<'_>,
    params: &PagedAttentionParams,
) -> Result<DeviceTensor, AscendOpsError> {
    let q = params.query;
    let geometry = params.geometry()?;
    debug!(
        "{OP}: batch {}, heads {}, head_dim {}, pages {}, kv_heads {}, page_size {}",
        q.dim0, q.dim1, q.dim2, geometry.num_pages, geometry.num_kv_heads, geometry.page_size
    );

    let output = ctx.allocate_output(OP, "output", vec![q.dim0, q.dim1, q.dim2], q.dtype)?;

    let q_dims = [q.dim0, q.dim1, q.dim2];
    let q_strides = [q.stride0, q.stride1, q.stride2];
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
    let value_cache = params.value_cache;
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
    let block_tables_dims = [params.block_tables.rows, params.block_tables.cols];
    let block_tables_strides = [
        params.block_tables.stride_row,
        params.block_tables.stride_col,
    ];
    let context_lens_dims = [params.context_lens.len];
    let context_lens_strides = [params.context_lens.stride];
    let y_strides = [q.dim1 * q.dim2, q.dim2, 1];

    let mut descriptors = DescriptorSet::new(runtime, OP);
    let q_acl = descriptors.create(
        "query",
        &TensorSpec::new(&q_dims, &q_strides, q.dtype.as_acl_dtype(), q.ptr.cast_mut()),
    )?;
    let key_cache_acl = descriptors.create(
        "key_cache",
        &TensorSpec::new(
            &key_cache_dims,
            &key_cache_strides,
            key_cache.dtype.as_acl_dtype(),
            key_cache.ptr.cast_mut(),
        ),
    )?;
    let value_cache_acl = descriptors.create(
        "value_cache",
        &TensorSpec::new(
            &value_cache_dims,
            &value_cache_strides,
            value_cache.dtype.as_acl_dtype(),
            value_cache.ptr.cast_mut(),
        ),
    )?;
    let block_tables_acl = descriptors.create(
        "block_tables",
        &TensorSpec::new(
            &block_tables_dims,
            &block_tables_strides,
            ffi::ACL_INT32,
            params.block_tables.ptr.cast_mut(),
        ),
    )?;
    let context_lens_acl = descriptors.create(
        "context_lens",
        &TensorSpec::new(
            &context_lens_dims,
            &context_lens_strides,
            ffi::ACL_INT32,
            params.context_lens.ptr.cast_mut(),
        ),
    )?;
    let y_acl = descriptors.create(
        "output",
        &TensorSpec::new(
            &q_dims,
            &y_strides,
            output.dtype().as_acl_dtype(),
            output.device_ptr(),
        ),
    )?;

    // SAFETY: descriptor handles are live until `finish`.
    let (workspace_size, executor) = unsafe {
        runtime.paged_attention_workspace_size(
            q_acl,
            key_cache_acl,
            value_cache_acl,
            block_tables_acl,
            context_lens_acl,
            y_acl,
        )?
    };
    let workspace = ctx.allocate_workspace(OP, workspace_size)?;
    // SAFETY: executor pairs with the size query above.
    let launch_result = unsafe {
        runtime.paged_attention_launch(
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
        (Ok(()), Ok(())) => Ok(output),
    }
}
