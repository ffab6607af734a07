#![cfg(feature = "aclrt")]

//! Real-device launches. Gated: set `ASCEND_OPS_RS_RUN_NPU_TESTS=1` on a
//! host with the CANN toolkit and the custom op library installed.

use ascend_ops_rs::{
    AclrtDevice, AddRmsNormParams, DType, DeviceAllocator, DeviceBuffer, GroupedMatmulParams,
    MatmulParams,
    PagedAttentionParams, ReshapeAndCacheParams, SwigluParams, Tensor1DDesc, Tensor1DI32Desc,
    Tensor1DI64Desc, Tensor2DDesc, Tensor2DI32Desc, Tensor3DDesc, Tensor4DDesc, add_rms_norm,
    grouped_matmul, matmul, paged_attention, reshape_and_cache, swiglu,
};
use half::f16;

fn should_run_npu_tests() -> bool {
    std::env::var("ASCEND_OPS_RS_RUN_NPU_TESTS").ok().as_deref() == Some("1")
}

fn encode_f16(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 2);
    for &value in values {
        bytes.extend_from_slice(&f16::from_f32(value).to_bits().to_le_bytes());
    }
    bytes
}

fn decode_f16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f16::from_bits(u16::from_le_bytes([pair[0], pair[1]])).to_f32())
        .collect()
}

fn encode_i32(values: &[i32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn encode_i64(values: &[i64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for &value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn ramp(len: usize, modulus: usize, scale: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i % modulus) as f32 - (modulus / 2) as f32) * scale)
        .collect()
}

#[test]
fn npu_swiglu_halves_the_feature_dimension() {
    if !should_run_npu_tests() {
        eprintln!("skipping NPU test (set ASCEND_OPS_RS_RUN_NPU_TESTS=1 to enable)");
        return;
    }

    let device = AclrtDevice::new(0).expect("open device 0");
    let ctx = device.execution_context();

    let rows = 4_usize;
    let cols = 128_usize;
    let x_host = ramp(rows * cols, 13, 0.125);
    let x_dev = device.upload(&encode_f16(&x_host)).expect("upload x");

    let params = SwigluParams::new(Tensor2DDesc {
        ptr: x_dev.device_ptr(),
        rows: rows as i64,
        cols: cols as i64,
        stride_row: cols as i64,
        stride_col: 1,
        dtype: DType::F16,
        device_id: 0,
    });
    let output = swiglu(&ctx, &params).expect("launch swiglu");
    device.synchronize().expect("synchronize");

    assert_eq!(output.dims(), &[rows as i64, (cols / 2) as i64]);

    let got = decode_f16(&device.download(output.into_buffer().as_ref()).expect("download"));
    let half_cols = cols / 2;
    for row in 0..rows {
        for col in 0..half_cols {
            let gate = x_host[row * cols + col];
            let up = x_host[row * cols + half_cols + col];
            let expected = gate / (1.0 + (-gate).exp()) * up;
            let actual = got[row * half_cols + col];
            assert!(
                (actual - expected).abs() < 5e-2,
                "row {row} col {col}: expected {expected}, got {actual}"
            );
        }
    }
}

#[test]
fn npu_add_rms_norm_matches_host_reference() {
    if !should_run_npu_tests() {
        eprintln!("skipping NPU test (set ASCEND_OPS_RS_RUN_NPU_TESTS=1 to enable)");
        return;
    }

    let device = AclrtDevice::new(0).expect("open device 0");
    let ctx = device.execution_context();

    let rows = 3_usize;
    let cols = 64_usize;
    let eps = 1e-6_f32;
    let x_host = ramp(rows * cols, 11, 0.0625);
    let residual_host = ramp(rows * cols, 7, 0.03125);
    let weight_host = ramp(cols, 5, 0.25);

    let x_dev = device.upload(&encode_f16(&x_host)).expect("upload x");
    let residual_dev = device
        .upload(&encode_f16(&residual_host))
        .expect("upload residual");
    let weight_dev = device
        .upload(&encode_f16(&weight_host))
        .expect("upload weight");

    let tensor2d = |ptr: *const std::ffi::c_void| Tensor2DDesc {
        ptr,
        rows: rows as i64,
        cols: cols as i64,
        stride_row: cols as i64,
        stride_col: 1,
        dtype: DType::F16,
        device_id: 0,
    };
    let params = AddRmsNormParams::new(
        tensor2d(x_dev.device_ptr()),
        tensor2d(residual_dev.device_ptr()),
        Tensor1DDesc {
            ptr: weight_dev.device_ptr(),
            len: cols as i64,
            stride: 1,
            dtype: DType::F16,
            device_id: 0,
        },
        eps,
    );
    let (normalized, updated_residual) = add_rms_norm(&ctx, &params).expect("launch add_rms_norm");
    device.synchronize().expect("synchronize");

    assert_eq!(normalized.dims(), &[rows as i64, cols as i64]);
    assert_eq!(updated_residual.dims(), &[rows as i64, cols as i64]);

    let got_y = decode_f16(
        &device
            .download(normalized.into_buffer().as_ref())
            .expect("download y"),
    );
    let got_residual = decode_f16(
        &device
            .download(updated_residual.into_buffer().as_ref())
            .expect("download residual"),
    );

    for row in 0..rows {
        let mut summed = vec![0.0_f32; cols];
        let mut mean_square = 0.0_f32;
        for col in 0..cols {
            let s = x_host[row * cols + col] + residual_host[row * cols + col];
            summed[col] = s;
            mean_square += s * s;
        }
        mean_square /= cols as f32;
        let inv_rms = 1.0 / (mean_square + eps).sqrt();
        for col in 0..cols {
            let expected_residual = summed[col];
            let expected_y = summed[col] * inv_rms * weight_host[col];
            let index = row * cols + col;
            assert!(
                (got_residual[index] - expected_residual).abs() < 5e-2,
                "residual[{index}]: expected {expected_residual}, got {}",
                got_residual[index]
            );
            assert!(
                (got_y[index] - expected_y).abs() < 5e-2,
                "y[{index}]: expected {expected_y}, got {}",
                got_y[index]
            );
        }
    }
}

#[test]
fn npu_reshape_and_cache_is_idempotent() {
    if !should_run_npu_tests() {
        eprintln!("skipping NPU test (set ASCEND_OPS_RS_RUN_NPU_TESTS=1 to enable)");
        return;
    }

    let device = AclrtDevice::new(0).expect("open device 0");
    let ctx = device.execution_context();

    let tokens = 3_usize;
    let kv_heads = 2_usize;
    let head_dim = 128_usize;
    let num_pages = 4_usize;
    let page_size = 16_usize;
    let channels = kv_heads * head_dim / 16;

    let key_host = ramp(tokens * kv_heads * head_dim, 17, 0.03125);
    let value_host = ramp(tokens * kv_heads * head_dim, 19, 0.03125);
    let cache_len = num_pages * channels * page_size * 16;

    let key_dev = device.upload(&encode_f16(&key_host)).expect("upload key");
    let value_dev = device
        .upload(&encode_f16(&value_host))
        .expect("upload value");
    let key_cache_dev = device
        .upload(&encode_f16(&vec![0.0; cache_len]))
        .expect("upload key_cache");
    let value_cache_dev = device
        .upload(&encode_f16(&vec![0.0; cache_len]))
        .expect("upload value_cache");
    let slots_dev = device
        .upload(&encode_i32(&[0, 5, 17]))
        .expect("upload slots");

    let key_desc = |ptr: *const std::ffi::c_void| Tensor3DDesc {
        ptr,
        dim0: tokens as i64,
        dim1: kv_heads as i64,
        dim2: head_dim as i64,
        stride0: (kv_heads * head_dim) as i64,
        stride1: head_dim as i64,
        stride2: 1,
        dtype: DType::F16,
        device_id: 0,
    };
    let cache_desc = |ptr: *const std::ffi::c_void| Tensor4DDesc {
        ptr,
        dim0: num_pages as i64,
        dim1: channels as i64,
        dim2: page_size as i64,
        dim3: 16,
        stride0: (channels * page_size * 16) as i64,
        stride1: (page_size * 16) as i64,
        stride2: 16,
        stride3: 1,
        dtype: DType::F16,
        device_id: 0,
    };
    let params = ReshapeAndCacheParams::new(
        key_desc(key_dev.device_ptr()),
        Some(key_desc(value_dev.device_ptr())),
        cache_desc(key_cache_dev.device_ptr()),
        Some(cache_desc(value_cache_dev.device_ptr())),
        Tensor1DI32Desc {
            ptr: slots_dev.device_ptr(),
            len: tokens as i64,
            stride: 1,
            device_id: 0,
        },
    );

    reshape_and_cache(&ctx, &params).expect("first write");
    device.synchronize().expect("synchronize");
    let after_first = device
        .download(key_cache_dev.as_ref())
        .expect("download after first write");

    reshape_and_cache(&ctx, &params).expect("second write");
    device.synchronize().expect("synchronize");
    let after_second = device
        .download(key_cache_dev.as_ref())
        .expect("download after second write");

    assert_eq!(after_first, after_second);
}

#[test]
fn npu_paged_attention_output_matches_query_shape() {
    if !should_run_npu_tests() {
        eprintln!("skipping NPU test (set ASCEND_OPS_RS_RUN_NPU_TESTS=1 to enable)");
        return;
    }

    let device = AclrtDevice::new(0).expect("open device 0");
    let ctx = device.execution_context();

    let batch = 2_usize;
    let num_heads = 4_usize;
    let kv_heads = 2_usize;
    let head_dim = 128_usize;
    let num_pages = 4_usize;
    let page_size = 16_usize;
    let channels = kv_heads * head_dim / 16;
    let cache_len = num_pages * channels * page_size * 16;

    let query_dev = device
        .upload(&encode_f16(&ramp(batch * num_heads * head_dim, 23, 0.03125)))
        .expect("upload query");
    let key_cache_dev = device
        .upload(&encode_f16(&ramp(cache_len, 29, 0.015625)))
        .expect("upload key_cache");
    let value_cache_dev = device
        .upload(&encode_f16(&ramp(cache_len, 31, 0.015625)))
        .expect("upload value_cache");
    let block_tables_dev = device
        .upload(&encode_i32(&[0, 1, 2, 3]))
        .expect("upload block_tables");
    let context_lens_dev = device
        .upload(&encode_i32(&[10, 7]))
        .expect("upload context_lens");

    let cache_desc = |ptr: *const std::ffi::c_void| Tensor4DDesc {
        ptr,
        dim0: num_pages as i64,
        dim1: channels as i64,
        dim2: page_size as i64,
        dim3: 16,
        stride0: (channels * page_size * 16) as i64,
        stride1: (page_size * 16) as i64,
        stride2: 16,
        stride3: 1,
        dtype: DType::F16,
        device_id: 0,
    };
    let params = PagedAttentionParams::new(
        Tensor3DDesc {
            ptr: query_dev.device_ptr(),
            dim0: batch as i64,
            dim1: num_heads as i64,
            dim2: head_dim as i64,
            stride0: (num_heads * head_dim) as i64,
            stride1: head_dim as i64,
            stride2: 1,
            dtype: DType::F16,
            device_id: 0,
        },
        cache_desc(key_cache_dev.device_ptr()),
        cache_desc(value_cache_dev.device_ptr()),
        Tensor2DI32Desc {
            ptr: block_tables_dev.device_ptr(),
            rows: batch as i64,
            cols: 2,
            stride_row: 2,
            stride_col: 1,
            device_id: 0,
        },
        Tensor1DI32Desc {
            ptr: context_lens_dev.device_ptr(),
            len: batch as i64,
            stride: 1,
            device_id: 0,
        },
    );

    let output = paged_attention(&ctx, &params).expect("launch paged_attention");
    device.synchronize().expect("synchronize");
    assert_eq!(
        output.dims(),
        &[batch as i64, num_heads as i64, head_dim as i64]
    );
}

#[test]
fn npu_grouped_matmul_output_shape_follows_weight_out_dim() {
    if !should_run_npu_tests() {
        eprintln!("skipping NPU test (set ASCEND_OPS_RS_RUN_NPU_TESTS=1 to enable)");
        return;
    }

    let device = AclrtDevice::new(0).expect("open device 0");
    let ctx = device.execution_context();

    let tokens = 8_usize;
    let in_dim = 64_usize;
    let out_dim = 64_usize;
    let experts = 2_usize;

    // K-major expert weights: element (e, d, o) at e*D*O + o*D + d.
    let mut weight_host = vec![0.0_f32; experts * in_dim * out_dim];
    for (i, slot) in weight_host.iter_mut().enumerate() {
        *slot = ((i % 37) as f32 - 18.0) * 0.015625;
    }

    let x_dev = device
        .upload(&encode_f16(&ramp(tokens * in_dim, 13, 0.0625)))
        .expect("upload x");
    let weight_dev = device
        .upload(&encode_f16(&weight_host))
        .expect("upload weight");
    let group_list_dev = device
        .upload(&encode_i64(&[4, 8]))
        .expect("upload group_list");

    let params = GroupedMatmulParams::new(
        Tensor2DDesc {
            ptr: x_dev.device_ptr(),
            rows: tokens as i64,
            cols: in_dim as i64,
            stride_row: in_dim as i64,
            stride_col: 1,
            dtype: DType::F16,
            device_id: 0,
        },
        Tensor3DDesc {
            ptr: weight_dev.device_ptr(),
            dim0: experts as i64,
            dim1: in_dim as i64,
            dim2: out_dim as i64,
            stride0: (in_dim * out_dim) as i64,
            stride1: 1,
            stride2: in_dim as i64,
            dtype: DType::F16,
            device_id: 0,
        },
        Tensor1DI64Desc {
            ptr: group_list_dev.device_ptr(),
            len: experts as i64,
            stride: 1,
            device_id: 0,
        },
    );

    let output = grouped_matmul(&ctx, &params).expect("launch grouped_matmul");
    device.synchronize().expect("synchronize");
    assert_eq!(output.dims(), &[tokens as i64, out_dim as i64]);
}

#[test]
fn npu_matmul_output_shape_follows_weight_out_dim() {
    if !should_run_npu_tests() {
        eprintln!("skipping NPU test (set ASCEND_OPS_RS_RUN_NPU_TESTS=1 to enable)");
        return;
    }

    let device = AclrtDevice::new(0).expect("open device 0");
    let ctx = device.execution_context();

    let tokens = 8_usize;
    let in_dim = 64_usize;
    let out_dim = 128_usize;

    let x_dev = device
        .upload(&encode_f16(&ramp(tokens * in_dim, 13, 0.0625)))
        .expect("upload x");
    let weight_dev = device
        .upload(&encode_f16(&ramp(out_dim * in_dim, 41, 0.015625)))
        .expect("upload weight");

    let params = MatmulParams::new(
        Tensor2DDesc {
            ptr: x_dev.device_ptr(),
            rows: tokens as i64,
            cols: in_dim as i64,
            stride_row: in_dim as i64,
            stride_col: 1,
            dtype: DType::F16,
            device_id: 0,
        },
        Tensor2DDesc {
            ptr: weight_dev.device_ptr(),
            rows: out_dim as i64,
            cols: in_dim as i64,
            stride_row: in_dim as i64,
            stride_col: 1,
            dtype: DType::F16,
            device_id: 0,
        },
    );

    let output = matmul(&ctx, &params).expect("launch matmul");
    device.synchronize().expect("synchronize");
    assert_eq!(output.dims(), &[tokens as i64, out_dim as i64]);
}
