use std::ffi::c_void;

use crate::context::{DeviceTensor, ExecutionContext};
use crate::descriptor::{DType, DescriptorSet, TensorSpec, transposed_weight_view};
use crate::error::AscendOpsError;
use crate::ffi;
use crate::runtime::AscendOpsRuntime;
use crate::swiglu::Tensor2DDesc;
use crate::validate::{
    check_contiguous_1d, check_contiguous_2d, check_feature_dim, check_non_null, check_positive,
};

const OP: &str = "grouped_matmul";

/// Borrowed rank-3 device tensor.
#[derive(Debug, Clone, Copy)]
pub struct Tensor3DDesc {
    pub ptr: *const c_void,
    pub dim0: i64,
    pub dim1: i64,
    pub dim2: i64,
    pub stride0: i64,
    pub stride1: i64,
    pub stride2: i64,
    pub dtype: DType,
    pub device_id: i32,
}

/// Borrowed rank-1 int64 device tensor.
#[derive(Debug, Clone, Copy)]
pub struct Tensor1DI64Desc {
    pub ptr: *const c_void,
    pub len: i64,
    pub stride: i64,
    pub device_id: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct GroupedMatmulParams {
    /// Routed activations, rank-2: `[num_tokens, in_dim]`, tokens sorted
    /// by expert.
    pub x: Tensor2DDesc,
    /// Expert weights, rank-3: logically `[num_experts, in_dim, out_dim]`
    /// but stored K-major (`in_dim` contiguous). The descriptor declares
    /// the `[num_experts, out_dim, in_dim]` view so `aclnnGroupedMatMulEx`
    /// reads the transpose without moving data.
    pub weight: Tensor3DDesc,
    /// Cumulative per-expert token boundaries, rank-1 int64:
    /// `[num_experts]`. Must be monotonically non-decreasing with the last
    /// entry equal to `num_tokens`; the values live on the device and are
    /// the caller's responsibility.
    pub group_list: Tensor1DI64Desc,
}

impl GroupedMatmulParams {
    pub fn new(x: Tensor2DDesc, weight: Tensor3DDesc, group_list: Tensor1DI64Desc) -> Self {
        Self {
            x,
            weight,
            group_list,
        }
    }

    pub fn validate(&self) -> Result<(), AscendOpsError> {
        check_non_null(OP, "x", self.x.ptr)?;
        check_non_null(OP, "weight", self.weight.ptr)?;
        check_non_null(OP, "group_list", self.group_list.ptr)?;
        check_contiguous_2d(
            OP,
            "x",
            [self.x.rows, self.x.cols],
            [self.x.stride_row, self.x.stride_col],
        )?;
        check_positive(OP, "weight.dim0", self.weight.dim0)?;
        check_positive(OP, "weight.dim1", self.weight.dim1)?;
        check_positive(OP, "weight.dim2", self.weight.dim2)?;
        check_contiguous_1d(OP, "group_list", self.group_list.len, self.group_list.stride)?;

        if self.weight.dim1 != self.x.cols {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "weight",
                format!("in_dim equal to x feature dimension ({})", self.x.cols),
                self.weight.dim1.to_string(),
            ));
        }
        // K-major storage: in_dim is the fastest-varying axis and the
        // out_dim axis steps by one in_dim row.
        if self.weight.stride1 != 1 || self.weight.stride2 != self.weight.dim1 {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "weight",
                format!(
                    "K-major storage (stride 1 along in_dim, stride {} along out_dim)",
                    self.weight.dim1
                ),
                format!(
                    "strides [{}, {}, {}]",
                    self.weight.stride0, self.weight.stride1, self.weight.stride2
                ),
            ));
        }
        check_feature_dim(OP, "weight.dim1", self.weight.dim1)?;
        check_feature_dim(OP, "weight.dim2", self.weight.dim2)?;

        if self.group_list.len != self.weight.dim0 {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "group_list",
                format!("one boundary per expert ({})", self.weight.dim0),
                self.group_list.len.to_string(),
            ));
        }

        if self.x.dtype != self.weight.dtype {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "weight",
                format!("dtype matching x ({:?})", self.x.dtype),
                format!("{:?}", self.weight.dtype),
            ));
        }
        if self.weight.device_id != self.x.device_id
            || self.group_list.device_id != self.x.device_id
        {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "weight",
                format!("all tensors on device {}", self.x.device_id),
                "a mixed-device operand set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expert-routed matrix multiplication: each contiguous token segment in
/// `x` (delimited by `group_list`) is multiplied by its expert's weight.
/// Returns `[num_tokens, out_dim]`.
pub fn grouped_matmul(
    ctx: &ExecutionContext<'_>,
    params: &GroupedMatmulParams,
) -> Result<DeviceTensor, AscendOpsError> {
    params.validate()?;
    ctx.ensure_same_device(OP, "x", params.x.device_id)?;
    let runtime = AscendOpsRuntime::global()?;
    // SAFETY: all FFI preconditions are validated above and by runtime
    // initialization.
    unsafe { grouped_matmul_with_runtime(runtime, ctx, params) }
}

unsafe fn grouped_matmul_with_runtime(
    runtime: &AscendOpsRuntime,
    ctx: &ExecutionContext<'_>,
    params: &GroupedMatmulParams,
) -> Result<DeviceTensor, AscendOpsError> {
    let x = params.x;
    let w = params.weight;
    let out_dim = w.dim2;
    let output = ctx.allocate_output(OP, "output", vec![x.rows, out_dim], x.dtype)?;

    let x_dims = [x.rows, x.cols];
    let x_strides = [x.stride_row, x.stride_col];
    let (w_dims, w_strides) = transposed_weight_view(
        [w.dim0, w.dim1, w.dim2],
        [w.stride0, w.stride1, w.stride2],
    );
    let group_list_dims = [params.group_list.len];
    let group_list_strides = [params.group_list.stride];
    let y_dims = [x.rows, out_dim];
    let y_strides = [out_dim, 1];

    let mut descriptors = DescriptorSet::new(runtime, OP);
    let x_acl = descriptors.create(
        "x",
        &TensorSpec::new(&x_dims, &x_strides, x.dtype.as_acl_dtype(), x.ptr.cast_mut()),
    )?;
    let w_acl = descriptors.create(
        "weight",
        &TensorSpec::new(&w_dims, &w_strides, w.dtype.as_acl_dtype(), w.ptr.cast_mut()),
    )?;
    let group_list_acl = descriptors.create(
        "group_list",
        &TensorSpec::new(
            &group_list_dims,
            &group_list_strides,
            ffi::ACL_INT64,
            params.group_list.ptr.cast_mut(),
        ),
    )?;
    let y_acl = descriptors.create(
        "output",
        &TensorSpec::new(
            &y_dims,
            &y_strides,
            output.dtype().as_acl_dtype(),
            output.device_ptr(),
        ),
    )?;

    // SAFETY: descriptor handles are live until `finish`.
    let (workspace_size, executor) =
        unsafe { runtime.grouped_matmul_workspace_size(x_acl, w_acl, group_list_acl, y_acl)? };
    let workspace = ctx.allocate_workspace(OP, workspace_size)?;
    // SAFETY: executor pairs with the size query above.
    let launch_result = unsafe {
        runtime.grouped_matmul_launch(
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
