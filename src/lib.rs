#[cfg(feature = "aclrt")]
pub mod aclrt;
pub mod add_rms_norm;
pub mod context;
mod descriptor;
pub mod error;
mod ffi;
pub mod grouped_matmul;
pub mod matmul;
pub mod paged_attention;
pub mod reshape_and_cache;
pub mod runtime;
pub mod swiglu;
mod validate;

#[cfg(feature = "aclrt")]
pub use aclrt::{AclrtDevice, DeviceMemory};
pub use add_rms_norm::{AddRmsNormParams, Tensor1DDesc, add_rms_norm};
pub use context::{AllocFailure, DeviceAllocator, DeviceBuffer, DeviceTensor, ExecutionContext};
pub use descriptor::DType;
pub use error::{AscendOpsError, KernelPhase};
pub use grouped_matmul::{GroupedMatmulParams, Tensor1DI64Desc, Tensor3DDesc, grouped_matmul};
pub use matmul::{MatmulParams, matmul};
pub use paged_attention::{CacheGeometry, PagedAttentionParams, Tensor2DI32Desc, paged_attention};
pub use reshape_and_cache::{
    ReshapeAndCacheParams, Tensor1DI32Desc, Tensor4DDesc, reshape_and_cache,
};
pub use runtime::{AscendOpsRuntime, RuntimeConfig};
pub use swiglu::{SwigluParams, Tensor2DDesc, swiglu};
