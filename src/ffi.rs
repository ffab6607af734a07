use std::ffi::{CStr, c_char, c_void};

/// Opaque `aclTensor` handle created by `aclCreateTensor`.
pub type AclTensorHandle = *mut c_void;

/// Opaque `aclOpExecutor` handle produced by a workspace size query and
/// consumed by the matching execute call.
pub type AclOpExecutorHandle = *mut c_void;

/// `aclrtStream` handle, borrowed from the host runtime per call.
pub type AclrtStream = *mut c_void;

pub const ACL_SUCCESS: i32 = 0;

// aclDataType tags consumed by aclCreateTensor.
pub const ACL_FLOAT: i32 = 0;
pub const ACL_FLOAT16: i32 = 1;
pub const ACL_INT32: i32 = 3;
pub const ACL_INT64: i32 = 9;
pub const ACL_BF16: i32 = 27;

// aclFormat tags. The serving kernels take every operand as ND; the
// FRACTAL_NZ tag exists because the paged caches are physically NZ-cast
// but still described as ND (the sub-block packing is explicit in the
// trailing extent).
pub const ACL_FORMAT_ND: i32 = 2;
#[allow(dead_code)]
pub const ACL_FORMAT_FRACTAL_NZ: i32 = 29;

/// `aclCreateTensor(viewDims, viewDimsNum, dataType, strides, offset,
/// format, storageDims, storageDimsNum, tensorData)`.
///
/// Returns null on failure.
pub type AclCreateTensorFn = unsafe extern "C" fn(
    *const i64,
    u64,
    i32,
    *const i64,
    i64,
    i32,
    *const i64,
    u64,
    *mut c_void,
) -> AclTensorHandle;

/// `aclDestroyTensor(tensor)`.
pub type AclDestroyTensorFn = unsafe extern "C" fn(AclTensorHandle) -> i32;

/// `aclGetRecentErrMsg()`; may return null when no message is pending.
pub type AclGetRecentErrMsgFn = unsafe extern "C" fn() -> *const c_char;

pub unsafe fn recent_err_msg_to_string(msg: *const c_char) -> String {
    if msg.is_null() {
        return String::new();
    }
    // SAFETY: caller guarantees msg points at a NUL-terminated string owned
    // by the ACL runtime for the duration of this call.
    unsafe { CStr::from_ptr(msg) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_recent_err_msg_is_empty() {
        // SAFETY: null is an accepted input.
        let message = unsafe { recent_err_msg_to_string(std::ptr::null()) };
        assert!(message.is_empty());
    }

    #[test]
    fn recent_err_msg_copies_the_c_string() {
        let raw = c"EZ9999: Inner Error";
        // SAFETY: raw is a valid NUL-terminated literal.
        let message = unsafe { recent_err_msg_to_string(raw.as_ptr()) };
        assert_eq!(message, "EZ9999: Inner Error");
    }

    #[test]
    fn dtype_tags_match_the_acl_enum() {
        assert_eq!(ACL_FLOAT, 0);
        assert_eq!(ACL_FLOAT16, 1);
        assert_eq!(ACL_INT32, 3);
        assert_eq!(ACL_INT64, 9);
        assert_eq!(ACL_BF16, 27);
        assert_eq!(ACL_FORMAT_ND, 2);
        assert_eq!(ACL_FORMAT_FRACTAL_NZ, 29);
    }
}
