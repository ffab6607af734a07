use crate::context::{DeviceTensor, ExecutionContext};
use crate::descriptor::{DescriptorSet, TensorSpec};
use crate::error::AscendOpsError;
use crate::runtime::AscendOpsRuntime;
use crate::swiglu::Tensor2DDesc;
use crate::validate::{check_contiguous_2d, check_feature_dim, check_non_null, check_positive};

const OP: &str = "matmul";

#[derive(Debug, Clone, Copy)]
pub struct MatmulParams {
    /// Activations, rank-2: `[num_tokens, in_dim]`.
    pub x: Tensor2DDesc,
    /// Projection weight, rank-2 `[out_dim, in_dim]` stored K-major
    /// (`in_dim` contiguous) and consumed as the transposed operand by
    /// `aclnnMatMulEx` without a copy.
    pub weight: Tensor2DDesc,
}

impl MatmulParams {
    pub fn new(x: Tensor2DDesc, weight: Tensor2DDesc) -> Self {
        Self { x, weight }
    }

    pub fn validate(&self) -> Result<(), AscendOpsError> {
        check_non_null(OP, "x", self.x.ptr)?;
        check_non_null(OP, "weight", self.weight.ptr)?;
        check_contiguous_2d(
            OP,
            "x",
            [self.x.rows, self.x.cols],
            [self.x.stride_row, self.x.stride_col],
        )?;
        check_positive(OP, "weight.rows", self.weight.rows)?;
        check_positive(OP, "weight.cols", self.weight.cols)?;
        if self.weight.stride_col != 1 || self.weight.stride_row != self.weight.cols {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "weight",
                format!(
                    "K-major storage (strides [{}, 1])",
                    self.weight.cols
                ),
                format!(
                    "strides [{}, {}]",
                    self.weight.stride_row, self.weight.stride_col
                ),
            ));
        }
        if self.weight.cols != self.x.cols {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "weight",
                format!("in_dim equal to x feature dimension ({})", self.x.cols),
                self.weight.cols.to_string(),
            ));
        }
        check_feature_dim(OP, "x", self.x.cols)?;
        check_feature_dim(OP, "weight.rows", self.weight.rows)?;
        if self.x.dtype != self.weight.dtype {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "weight",
                format!("dtype matching x ({:?})", self.x.dtype),
                format!("{:?}", self.weight.dtype),
            ));
        }
        if self.x.device_id != self.weight.device_id {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "weight",
                format!("tensor on device {}", self.x.device_id),
                format!("device {}", self.weight.device_id),
            ));
        }
        Ok(())
    }
}

/// Dense projection `y = x @ weight^T`, returning `[num_tokens, out_dim]`.
pub fn matmul(
    ctx: &ExecutionContext<'_>,
    params: &MatmulParams,
) -> Result<DeviceTensor, AscendOpsError> {
    params.validate()?;
    ctx.ensure_same_device(OP, "x", params.x.device_id)?;
    let runtime = AscendOpsRuntime::global()?;
    // SAFETY: all FFI preconditions are validated above and by runtime
    // initialization.
    unsafe { matmul_with_runtime(runtime, ctx, params) }
}

unsafe fn matmul_with_runtime(
    runtime: &AscendOpsRuntime,
    ctx: &ExecutionContext<'_>,
    params: &MatmulParams,
) -> Result<DeviceTensor, AscendOpsError> {
    let x = params.x;
    let w = params.weight;
    let output = ctx.allocate_output(OP, "output", vec![x.rows, w.rows], x.dtype)?;

    let x_dims = [x.rows, x.cols];
    let x_strides = [x.stride_row, x.stride_col];
    let w_dims = [w.rows, w.cols];
    let w_strides = [w.stride_row, w.stride_col];
    let y_dims = [x.rows, w.rows];
    let y_strides = [w.rows, 1];

    let mut descriptors = DescriptorSet::new(runtime, OP);
    let x_acl = descriptors.create(
        "x",
        &TensorSpec::new(&x_dims, &x_strides, x.dtype.as_acl_dtype(), x.ptr.cast_mut()),
    )?;
    let w_acl = descriptors.create(
        "weight",
        &TensorSpec::new(&w_dims, &w_strides, w.dtype.as_acl_dtype(), w.ptr.cast_mut()),
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
        unsafe { runtime.matmul_workspace_size(x_acl, w_acl, y_acl)? };
    let workspace = ctx.allocate_workspace(OP, workspace_size)?;
    // SAFETY: executor pairs with the size query above.
    let launch_result = unsafe {
        runtime.matmul_launch(
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DType;
    use std::ffi::c_void;

    fn non_null() -> *const c_void {
        std::ptr::NonNull::<u8>::dangling().as_ptr().cast()
    }

    fn valid_params() -> MatmulParams {
        MatmulParams::new(
            Tensor2DDesc {
                ptr: non_null(),
                rows: 16,
                cols: 4096,
                stride_row: 4096,
                stride_col: 1,
                dtype: DType::F16,
                device_id: 0,
            },
            Tensor2DDesc {
                ptr: non_null(),
                rows: 12288,
                cols: 4096,
                stride_row: 4096,
                stride_col: 1,
                dtype: DType::F16,
                device_id: 0,
            },
        )
    }

    #[test]
    fn validate_accepts_k_major_weight() {
        assert!(valid_params().validate().is_ok());
    }

    #[test]
    fn validate_rejects_non_k_major_weight() {
        let mut params = valid_params();
        params.weight.stride_row = 1;
        params.weight.stride_col = 12288;
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("K-major"));
    }

    #[test]
    fn validate_rejects_in_dim_mismatch() {
        let mut params = valid_params();
        params.weight.cols = 2048;
        params.weight.stride_row = 2048;
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_dtype_mismatch() {
        let mut params = valid_params();
        params.weight.dtype = DType::Bf16;
        assert!(params.validate().is_err());
    }
}
