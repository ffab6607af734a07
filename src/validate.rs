use std::ffi::c_void;

use crate::error::AscendOpsError;

// Shape/layout checks shared by every operation adapter. All failures are
// `InvalidArgument` and fire before any native resource exists.

pub(crate) fn check_non_null(
    op: &'static str,
    argument: &'static str,
    ptr: *const c_void,
) -> Result<(), AscendOpsError> {
    if ptr.is_null() {
        return Err(AscendOpsError::invalid_argument(
            op,
            argument,
            "a non-null device pointer",
            "null",
        ));
    }
    Ok(())
}

pub(crate) fn check_positive(
    op: &'static str,
    argument: &'static str,
    value: i64,
) -> Result<(), AscendOpsError> {
    if value <= 0 {
        return Err(AscendOpsError::invalid_argument(
            op,
            argument,
            "a positive extent",
            value.to_string(),
        ));
    }
    Ok(())
}

/// Feature-axis tiling requirement of the fused kernels: at least one full
/// 64-element tile and whole tiles only.
pub(crate) fn check_feature_dim(
    op: &'static str,
    argument: &'static str,
    value: i64,
) -> Result<(), AscendOpsError> {
    if value < 64 || value % 64 != 0 {
        return Err(AscendOpsError::invalid_argument(
            op,
            argument,
            "feature dimension to be a multiple of 64 (minimum 64)",
            value.to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn check_contiguous_1d(
    op: &'static str,
    argument: &'static str,
    len: i64,
    stride: i64,
) -> Result<(), AscendOpsError> {
    check_positive(op, argument, len)?;
    if stride != 1 {
        return Err(AscendOpsError::invalid_argument(
            op,
            argument,
            "a contiguous layout (stride 1)",
            format!("stride {stride}"),
        ));
    }
    Ok(())
}

pub(crate) fn check_contiguous_2d(
    op: &'static str,
    argument: &'static str,
    dims: [i64; 2],
    strides: [i64; 2],
) -> Result<(), AscendOpsError> {
    for dim in dims {
        check_positive(op, argument, dim)?;
    }
    if strides[1] != 1 || strides[0] != dims[1] {
        return Err(AscendOpsError::invalid_argument(
            op,
            argument,
            format!("a contiguous row-major layout (strides [{}, 1])", dims[1]),
            format!("strides [{}, {}]", strides[0], strides[1]),
        ));
    }
    Ok(())
}

pub(crate) fn check_contiguous_3d(
    op: &'static str,
    argument: &'static str,
    dims: [i64; 3],
    strides: [i64; 3],
) -> Result<(), AscendOpsError> {
    for dim in dims {
        check_positive(op, argument, dim)?;
    }
    let expected = [dims[1] * dims[2], dims[2], 1];
    if strides != expected {
        return Err(AscendOpsError::invalid_argument(
            op,
            argument,
            format!(
                "a contiguous row-major layout (strides [{}, {}, 1])",
                expected[0], expected[1]
            ),
            format!(
                "strides [{}, {}, {}]",
                strides[0], strides[1], strides[2]
            ),
        ));
    }
    Ok(())
}

pub(crate) fn check_contiguous_4d(
    op: &'static str,
    argument: &'static str,
    dims: [i64; 4],
    strides: [i64; 4],
) -> Result<(), AscendOpsError> {
    for dim in dims {
        check_positive(op, argument, dim)?;
    }
    let expected = [dims[1] * dims[2] * dims[3], dims[2] * dims[3], dims[3], 1];
    if strides != expected {
        return Err(AscendOpsError::invalid_argument(
            op,
            argument,
            format!(
                "a contiguous row-major layout (strides [{}, {}, {}, 1])",
                expected[0], expected[1], expected[2]
            ),
            format!(
                "strides [{}, {}, {}, {}]",
                strides[0], strides[1], strides[2], strides[3]
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_dim_rejects_non_tile_multiples() {
        assert!(check_feature_dim("swiglu", "input", 63).is_err());
        assert!(check_feature_dim("swiglu", "input", 65).is_err());
        assert!(check_feature_dim("swiglu", "input", 0).is_err());
        assert!(check_feature_dim("swiglu", "input", 64).is_ok());
        assert!(check_feature_dim("swiglu", "input", 4096).is_ok());
    }

    #[test]
    fn contiguous_2d_rejects_column_slices() {
        // A [4, 8] view sliced out of a wider [4, 16] row.
        let err = check_contiguous_2d("swiglu", "input", [4, 8], [16, 1]).unwrap_err();
        assert!(err.to_string().contains("contiguous"));
    }

    #[test]
    fn contiguous_3d_expects_dense_strides() {
        assert!(check_contiguous_3d("reshape_and_cache", "key", [3, 4, 128], [512, 128, 1]).is_ok());
        assert!(
            check_contiguous_3d("reshape_and_cache", "key", [3, 4, 128], [512, 128, 2]).is_err()
        );
    }

    #[test]
    fn contiguous_4d_expects_dense_strides() {
        assert!(
            check_contiguous_4d(
                "reshape_and_cache",
                "key_cache",
                [64, 32, 128, 16],
                [65536, 2048, 16, 1]
            )
            .is_ok()
        );
        assert!(
            check_contiguous_4d(
                "reshape_and_cache",
                "key_cache",
                [64, 32, 128, 16],
                [65536, 2048, 32, 1]
            )
            .is_err()
        );
    }
}
