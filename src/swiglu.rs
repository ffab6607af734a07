use std::ffi::c_void;

use crate::context::{DeviceTensor, ExecutionContext};
use crate::descriptor::{DType, DescriptorSet, TensorSpec};
use crate::error::AscendOpsError;
use crate::runtime::AscendOpsRuntime;
use crate::validate::{check_contiguous_2d, check_feature_dim, check_non_null};

const OP: &str = "swiglu";

/// Borrowed rank-2 device tensor: pointer, extents, strides in elements.
#[derive(Debug, Clone, Copy)]
pub struct Tensor2DDesc {
    pub ptr: *const c_void,
    pub rows: i64,
    pub cols: i64,
    pub stride_row: i64,
    pub stride_col: i64,
    pub dtype: DType,
    pub device_id: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct SwigluParams {
    /// Gate-and-up projected activations, rank-2: `[num_tokens, 2 * d]`.
    /// The two halves of the trailing axis are the gate and up halves
    /// consumed by `aclnnSwiGluEx`.
    pub input: Tensor2DDesc,
}

impl SwigluParams {
    pub fn new(input: Tensor2DDesc) -> Self {
        Self { input }
    }

    pub fn validate(&self) -> Result<(), AscendOpsError> {
        check_non_null(OP, "input", self.input.ptr)?;
        check_contiguous_2d(
            OP,
            "input",
            [self.input.rows, self.input.cols],
            [self.input.stride_row, self.input.stride_col],
        )?;
        check_feature_dim(OP, "input", self.input.cols)?;
        Ok(())
    }
}

/// Gated activation. Splits the trailing axis in half and combines the
/// halves through the SwiGLU nonlinearity, returning a fresh
/// `[num_tokens, d]` tensor (half the input width).
pub fn swiglu(
    ctx: &ExecutionContext<'_>,
    params: &SwigluParams,
) -> Result<DeviceTensor, AscendOpsError> {
    params.validate()?;
    ctx.ensure_same_device(OP, "input", params.input.device_id)?;
    let runtime = AscendOpsRuntime::global()?;
    // SAFETY: all FFI preconditions are validated above and by runtime
    // initialization.
    unsafe { swiglu_with_runtime(runtime, ctx, params) }
}

unsafe fn swiglu_with_runtime(
    runtime: &AscendOpsRuntime,
    ctx: &ExecutionContext<'_>,
    params: &SwigluParams,
) -> Result<DeviceTensor, AscendOpsError> {
    let x = params.input;
    let output = ctx.allocate_output(OP, "output", vec![x.rows, x.cols / 2], x.dtype)?;

    let x_dims = [x.rows, x.cols];
    let x_strides = [x.stride_row, x.stride_col];
    let y_dims = [x.rows, x.cols / 2];
    let y_strides = [x.cols / 2, 1];

    let mut descriptors = DescriptorSet::new(runtime, OP);
    let x_acl = descriptors.create(
        "input",
        &TensorSpec::new(&x_dims, &x_strides, x.dtype.as_acl_dtype(), x.ptr.cast_mut()),
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
    let (workspace_size, executor) = unsafe { runtime.swiglu_workspace_size(x_acl, y_acl)? };
    let workspace = ctx.allocate_workspace(OP, workspace_size)?;
    // SAFETY: executor pairs with the size query above; the stream is the
    // caller's current stream.
    let launch_result = unsafe {
        runtime.swiglu_launch(
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

    fn non_null() -> *const c_void {
        std::ptr::NonNull::<u8>::dangling().as_ptr().cast()
    }

    fn valid_params() -> SwigluParams {
        SwigluParams::new(Tensor2DDesc {
            ptr: non_null(),
            rows: 8,
            cols: 256,
            stride_row: 256,
            stride_col: 1,
            dtype: DType::F16,
            device_id: 0,
        })
    }

    #[test]
    fn validate_accepts_dense_tile_aligned_input() {
        assert!(valid_params().validate().is_ok());
    }

    #[test]
    fn validate_rejects_null_pointer() {
        let mut params = valid_params();
        params.input.ptr = std::ptr::null();
        assert!(params.validate().is_err());
    }

    #[test]
    fn validate_rejects_unaligned_feature_dimension() {
        let mut params = valid_params();
        params.input.cols = 63;
        params.input.stride_row = 63;
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("feature dimension"));
        assert!(err.to_string().contains("63"));
    }

    #[test]
    fn validate_rejects_strided_input() {
        let mut params = valid_params();
        params.input.stride_row = 512;
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("contiguous"));
    }

    #[test]
    fn validate_rejects_empty_rows() {
        let mut params = valid_params();
        params.input.rows = 0;
        assert!(params.validate().is_err());
    }
}
