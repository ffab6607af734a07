use std::ffi::c_void;

use crate::error::AscendOpsError;
use crate::ffi::{self, AclTensorHandle};

/// Element type of activation, weight and cache tensors. The serving
/// kernels operate on 16-bit floats only; index operands carry their own
/// fixed-width integer tags internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F16,
    Bf16,
}

impl DType {
    pub(crate) fn as_acl_dtype(self) -> i32 {
        match self {
            DType::F16 => ffi::ACL_FLOAT16,
            DType::Bf16 => ffi::ACL_BF16,
        }
    }

    pub(crate) fn size_bytes(self) -> usize {
        match self {
            DType::F16 | DType::Bf16 => 2,
        }
    }
}

/// Field bundle for one `aclCreateTensor` call. View extents and strides
/// are passed verbatim; storage extents equal the view extents (the
/// kernels take every operand as ND with explicit strides).
pub(crate) struct TensorSpec<'a> {
    pub dims: &'a [i64],
    pub strides: &'a [i64],
    pub dtype: i32,
    pub data: *mut c_void,
}

impl<'a> TensorSpec<'a> {
    pub(crate) fn new(dims: &'a [i64], strides: &'a [i64], dtype: i32, data: *mut c_void) -> Self {
        debug_assert_eq!(dims.len(), strides.len());
        Self {
            dims,
            strides,
            dtype,
            data,
        }
    }
}

/// Descriptor factory boundary. The loaded kernel runtime implements this
/// over `aclCreateTensor`/`aclDestroyTensor`; tests implement it with
/// counters.
pub(crate) trait DescriptorHost {
    /// Returns null on failure.
    unsafe fn create_tensor(&self, spec: &TensorSpec<'_>) -> AclTensorHandle;
    /// Returns an ACL status code.
    unsafe fn destroy_tensor(&self, handle: AclTensorHandle) -> i32;
}

struct Entry {
    handle: AclTensorHandle,
    argument: &'static str,
}

/// Owns every `aclTensor` created for one kernel invocation and
/// guarantees each is destroyed exactly once. `finish` surfaces destroy
/// failures; the drop path destroys best-effort for early returns.
pub(crate) struct DescriptorSet<'a> {
    host: &'a dyn DescriptorHost,
    op: &'static str,
    entries: Vec<Entry>,
}

impl<'a> DescriptorSet<'a> {
    pub(crate) fn new(host: &'a dyn DescriptorHost, op: &'static str) -> Self {
        Self {
            host,
            op,
            entries: Vec::new(),
        }
    }

    /// Create a descriptor for one operand. The returned raw handle stays
    /// owned by the set; it is only valid until `finish` or drop.
    pub(crate) fn create(
        &mut self,
        argument: &'static str,
        spec: &TensorSpec<'_>,
    ) -> Result<AclTensorHandle, AscendOpsError> {
        // SAFETY: spec fields follow the aclCreateTensor contract and the
        // pointed-to arrays outlive the call.
        let handle = unsafe { self.host.create_tensor(spec) };
        if handle.is_null() {
            return Err(AscendOpsError::DescriptorCreation {
                op: self.op,
                argument,
            });
        }
        self.entries.push(Entry { handle, argument });
        Ok(handle)
    }

    /// Destroy every descriptor. All entries are destroyed even when one
    /// destroy fails; the first failure is returned. Ordering between
    /// descriptors does not matter, completeness does.
    pub(crate) fn finish(&mut self) -> Result<(), AscendOpsError> {
        let mut first_failure = None;
        for entry in self.entries.drain(..) {
            // SAFETY: handle came from create_tensor and is destroyed once.
            let code = unsafe { self.host.destroy_tensor(entry.handle) };
            if code != ffi::ACL_SUCCESS && first_failure.is_none() {
                first_failure = Some(AscendOpsError::Teardown {
                    op: self.op,
                    argument: entry.argument,
                    code,
                });
            }
        }
        match first_failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Drop for DescriptorSet<'_> {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            // SAFETY: best-effort destroy on early-return paths.
            let _ = unsafe { self.host.destroy_tensor(entry.handle) };
        }
    }
}

/// Logical view of a K-major grouped weight: swaps the two trailing axes
/// of `[experts, in_dim, out_dim]` so the kernel reads the declared
/// `[experts, out_dim, in_dim]` without any data movement.
pub(crate) fn transposed_weight_view(
    dims: [i64; 3],
    strides: [i64; 3],
) -> ([i64; 3], [i64; 3]) {
    (
        [dims[0], dims[2], dims[1]],
        [strides[0], strides[2], strides[1]],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingHost {
        created: Cell<usize>,
        destroyed: Cell<usize>,
        fail_create_at: Cell<Option<usize>>,
        fail_destroy_at: Cell<Option<usize>>,
    }

    impl DescriptorHost for CountingHost {
        unsafe fn create_tensor(&self, _spec: &TensorSpec<'_>) -> AclTensorHandle {
            let index = self.created.get();
            if self.fail_create_at.get() == Some(index) {
                return std::ptr::null_mut();
            }
            self.created.set(index + 1);
            (index + 1) as AclTensorHandle
        }

        unsafe fn destroy_tensor(&self, _handle: AclTensorHandle) -> i32 {
            let index = self.destroyed.get();
            self.destroyed.set(index + 1);
            if self.fail_destroy_at.get() == Some(index) {
                return 161001;
            }
            ffi::ACL_SUCCESS
        }
    }

    fn spec() -> (Vec<i64>, Vec<i64>) {
        (vec![2, 64], vec![64, 1])
    }

    #[test]
    fn finish_destroys_every_created_descriptor() {
        let host = CountingHost::default();
        let mut set = DescriptorSet::new(&host, "swiglu");
        let (dims, strides) = spec();
        for argument in ["input", "output"] {
            set.create(
                argument,
                &TensorSpec::new(&dims, &strides, ffi::ACL_FLOAT16, std::ptr::null_mut()),
            )
            .expect("create");
        }
        set.finish().expect("teardown");
        assert_eq!(host.created.get(), 2);
        assert_eq!(host.destroyed.get(), 2);
    }

    #[test]
    fn drop_destroys_descriptors_on_early_return_paths() {
        let host = CountingHost::default();
        let (dims, strides) = spec();
        {
            let mut set = DescriptorSet::new(&host, "swiglu");
            set.create(
                "input",
                &TensorSpec::new(&dims, &strides, ffi::ACL_FLOAT16, std::ptr::null_mut()),
            )
            .expect("create");
        }
        assert_eq!(host.created.get(), 1);
        assert_eq!(host.destroyed.get(), 1);
    }

    #[test]
    fn failed_create_reports_the_argument_and_cleans_up_prior_handles() {
        let host = CountingHost::default();
        host.fail_create_at.set(Some(1));
        let (dims, strides) = spec();
        let mut set = DescriptorSet::new(&host, "grouped_matmul");
        set.create(
            "x",
            &TensorSpec::new(&dims, &strides, ffi::ACL_FLOAT16, std::ptr::null_mut()),
        )
        .expect("first create");
        let err = set
            .create(
                "weight",
                &TensorSpec::new(&dims, &strides, ffi::ACL_FLOAT16, std::ptr::null_mut()),
            )
            .unwrap_err();
        match err {
            AscendOpsError::DescriptorCreation { op, argument } => {
                assert_eq!(op, "grouped_matmul");
                assert_eq!(argument, "weight");
            }
            other => panic!("unexpected error: {other}"),
        }
        drop(set);
        assert_eq!(host.created.get(), 1);
        assert_eq!(host.destroyed.get(), 1);
    }

    #[test]
    fn failed_destroy_still_destroys_the_rest() {
        let host = CountingHost::default();
        host.fail_destroy_at.set(Some(0));
        let (dims, strides) = spec();
        let mut set = DescriptorSet::new(&host, "add_rms_norm");
        for argument in ["x", "residual", "weight"] {
            set.create(
                argument,
                &TensorSpec::new(&dims, &strides, ffi::ACL_FLOAT16, std::ptr::null_mut()),
            )
            .expect("create");
        }
        let err = set.finish().unwrap_err();
        match err {
            AscendOpsError::Teardown { op, argument, code } => {
                assert_eq!(op, "add_rms_norm");
                assert_eq!(argument, "x");
                assert_eq!(code, 161001);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Destroy attempts cover every handle despite the first failure.
        assert_eq!(host.destroyed.get(), 3);
    }

    #[test]
    fn weight_view_swaps_trailing_axes_only() {
        let (dims, strides) = transposed_weight_view([8, 4096, 12288], [4096 * 12288, 1, 4096]);
        assert_eq!(dims, [8, 12288, 4096]);
        assert_eq!(strides, [4096 * 12288, 4096, 1]);
    }

    #[test]
    fn weight_view_of_k_major_storage_is_dense_in_view_order() {
        let in_dim = 128_i64;
        let out_dim = 256_i64;
        let (dims, strides) =
            transposed_weight_view([2, in_dim, out_dim], [in_dim * out_dim, 1, in_dim]);
        // The declared view walks memory contiguously: stride of the last
        // view axis is 1 and each axis stride is the product of the later
        // extents.
        assert_eq!(strides[2], 1);
        assert_eq!(strides[1], dims[2]);
        assert_eq!(strides[0], dims[1] * dims[2]);
    }
}
