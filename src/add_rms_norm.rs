use std::ffi::c_void;

use crate::context::{DeviceTensor, ExecutionContext};
use crate::descriptor::{DType, DescriptorSet, TensorSpec};
use crate::error::AscendOpsError;
use crate::ffi;
use crate::runtime::AscendOpsRuntime;
use crate::swiglu::Tensor2DDesc;
use crate::validate::{
    check_contiguous_1d, check_contiguous_2d, check_feature_dim, check_non_null,
};

const OP: &str = "add_rms_norm";

/// Borrowed rank-1 device tensor.
#[derive(Debug, Clone, Copy)]
pub struct Tensor1DDesc {
    pub ptr: *const c_void,
    pub len: i64,
    pub stride: i64,
    pub dtype: DType,
    pub device_id: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct AddRmsNormParams {
    /// Activations, rank-2: `[num_tokens, hidden]`.
    pub x: Tensor2DDesc,
    /// Residual stream, rank-2: `[num_tokens, hidden]`, added to `x`
    /// before normalization.
    pub residual: Tensor2DDesc,
    /// RMSNorm scale, rank-1: `[hidden]`.
    pub weight: Tensor1DDesc,
    /// Numerical stability epsilon; staged to the device as a
    /// single-element f32 tensor per the `aclnnAddRMSNormEx` contract.
    pub epsilon: f32,
}

impl AddRmsNormParams {
    pub fn new(
        x: Tensor2DDesc,
        residual: Tensor2DDesc,
        weight: Tensor1DDesc,
        epsilon: f32,
    ) -> Self {
        Self {
            x,
            residual,
            weight,
            epsilon,
        }
    }

    pub fn validate(&self) -> Result<(), AscendOpsError> {
        check_non_null(OP, "x", self.x.ptr)?;
        check_non_null(OP, "residual", self.residual.ptr)?;
        check_non_null(OP, "weight", self.weight.ptr)?;
        check_contiguous_2d(
            OP,
            "x",
            [self.x.rows, self.x.cols],
            [self.x.stride_row, self.x.stride_col],
        )?;
        check_contiguous_2d(
            OP,
            "residual",
            [self.residual.rows, self.residual.cols],
            [self.residual.stride_row, self.residual.stride_col],
        )?;
        check_contiguous_1d(OP, "weight", self.weight.len, self.weight.stride)?;

        if self.residual.rows != self.x.rows || self.residual.cols != self.x.cols {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "residual",
                format!("shape matching x ([{}, {}])", self.x.rows, self.x.cols),
                format!("[{}, {}]", self.residual.rows, self.residual.cols),
            ));
        }
        if self.weight.len != self.x.cols {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "weight",
                format!("length equal to x feature dimension ({})", self.x.cols),
                self.weight.len.to_string(),
            ));
        }
        check_feature_dim(OP, "x", self.x.cols)?;

        if self.x.dtype != self.residual.dtype || self.x.dtype != self.weight.dtype {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "weight",
                format!("dtype matching x ({:?})", self.x.dtype),
                "a mixed-dtype operand set".to_string(),
            ));
        }
        if self.residual.device_id != self.x.device_id
            || self.weight.device_id != self.x.device_id
        {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "residual",
                format!("all tensors on device {}", self.x.device_id),
                "a mixed-device operand set".to_string(),
            ));
        }
        if !self.epsilon.is_finite() {
            return Err(AscendOpsError::invalid_argument(
                OP,
                "epsilon",
                "a finite value",
                self.epsilon.to_string(),
            ));
        }
        Ok(())
    }
}

/// Fused residual add + RMS normalization. Returns the normalized
/// activations and the updated residual stream, both `[num_tokens,
/// hidden]`, as fresh tensors.
pub fn add_rms_norm(
    ctx: &ExecutionContext<'_>,
    params: &AddRmsNormParams,
) -> Result<(DeviceTensor, DeviceTensor), AscendOpsError> {
    params.validate()?;
    ctx.ensure_same_device(OP, "x", params.x.device_id)?;
    let runtime = AscendOpsRuntime::global()?;
    // SAFETY: all FFI preconditions are validated above and by runtime
    // initialization.
    unsafe { add_rms_norm_with_runtime(runtime, ctx, params) }
}

unsafe fn add_rms_norm_with_runtime(
    runtime: &AscendOpsRuntime,
    ctx: &ExecutionContext<'_>,
    params: &AddRmsNormParams,
) -> Result<(DeviceTensor, DeviceTensor), AscendOpsError> {
    let x = params.x;
    let output = ctx.allocate_output(OP, "output", vec![x.rows, x.cols], x.dtype)?;
    let residual_output =
        ctx.allocate_output(OP, "residual_output", vec![x.rows, x.cols], x.dtype)?;
    let epsilon_buffer = ctx.upload_host(OP, "epsilon", &params.epsilon.to_ne_bytes())?;

    let x_dims = [x.rows, x.cols];
    let x_strides = [x.stride_row, x.stride_col];
    let residual_dims = [params.residual.rows, params.residual.cols];
    let residual_strides = [params.residual.stride_row, params.residual.stride_col];
    let weight_dims = [params.weight.len];
    let weight_strides = [params.weight.stride];
    let epsilon_dims = [1_i64];
    let epsilon_strides = [1_i64];
    let out_dims = [x.rows, x.cols];
    let out_strides = [x.cols, 1];

    let mut descriptors = DescriptorSet::new(runtime, OP);
    let x_acl = descriptors.create(
        "x",
        &TensorSpec::new(&x_dims, &x_strides, x.dtype.as_acl_dtype(), x.ptr.cast_mut()),
    )?;
    let residual_acl = descriptors.create(
        "residual",
        &TensorSpec::new(
            &residual_dims,
            &residual_strides,
            params.residual.dtype.as_acl_dtype(),
            params.residual.ptr.cast_mut(),
        ),
    )?;
    let weight_acl = descriptors.create(
        "weight",
        &TensorSpec::new(
            &weight_dims,
            &weight_strides,
            params.weight.dtype.as_acl_dtype(),
            params.weight.ptr.cast_mut(),
        ),
    )?;
    let epsilon_acl = descriptors.create(
        "epsilon",
        &TensorSpec::new(
            &epsilon_dims,
            &epsilon_strides,
            ffi::ACL_FLOAT,
            epsilon_buffer.device_ptr(),
        ),
    )?;
    let y_acl = descriptors.create(
        "output",
        &TensorSpec::new(
            &out_dims,
            &out_strides,
            output.dtype().as_acl_dtype(),
            output.device_ptr(),
        ),
    )?;
    let residual_output_acl = descriptors.create(
        "residual_output",
        &TensorSpec::new(
            &out_dims,
            &out_strides,
            residual_output.dtype().as_acl_dtype(),
            residual_output.device_ptr(),
        ),
    )?;

    // SAFETY: descriptor handles are live until `finish`.
    let (workspace_size, executor) = unsafe {
        runtime.add_rms_norm_workspace_size(
            x_acl,
            residual_acl,
            weight_acl,
            epsilon_acl,
            y_acl,
            residual_output_acl,
        )?
    };
    let workspace = ctx.allocate_workspace(OP, workspace_size)?;
    // SAFETY: executor pairs with the size query above; the epsilon buffer
    // stays alive past the enqueue.
    let launch_result = unsafe {
        runtime.add_rms_norm_launch(
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
        (Ok(()), Ok(())) => Ok((output, residual_output)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn non_null() -> *const c_void {
        std::ptr::NonNull::<u8>::dangling().as_ptr().cast()
    }

    fn valid_params() -> AddRmsNormParams {
        let tensor = Tensor2DDesc {
            ptr: non_null(),
            rows: 4,
            cols: 128,
            stride_row: 128,
            stride_col: 1,
            dtype: DType::F16,
            device_id: 0,
        };
        AddRmsNormParams::new(
            tensor,
            tensor,
            Tensor1DDesc {
                ptr: non_null(),
                len: 128,
                stride: 1,
                dtype: DType::F16,
                device_id: 0,
            },
            1e-6,
        )
    }

    #[test]
    fn validate_accepts_matching_shapes() {
        assert!(valid_params().validate().is_ok());
    }

    #[test]
    fn validate_rejects_residual_shape_mismatch() {
        let mut params = valid_params();
        params.residual.rows = 8;
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_weight_length_mismatch() {
        let mut params = valid_params();
        params.weight.len = 64;
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_unaligned_hidden_dimension() {
        let mut params = valid_params();
        params.x.cols = 100;
        params.x.stride_row = 100;
        params.residual.cols = 100;
        params.residual.stride_row = 100;
        params.weight.len = 100;
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("feature dimension"));
    }

    #[test]
    fn validate_rejects_non_finite_epsilon() {
        let mut params = valid_params();
        params.epsilon = f32::NAN;
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_strided_weight() {
        let mut params = valid_params();
        params.weight.stride = 2;
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("contiguous"));
    }
}
