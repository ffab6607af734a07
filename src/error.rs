use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Phase of a kernel invocation that failed.
///
/// Every operation follows the same two-phase calling convention: a
/// workspace size query (`aclnn*ExGetWorkspaceSize`) followed by the
/// asynchronous execute (`aclnn*Ex`). Device allocation sits between the
/// two and covers workspace, output and staged-scalar buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelPhase {
    SizeQuery,
    DeviceAlloc,
    Execute,
}

impl fmt::Display for KernelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KernelPhase::SizeQuery => "size query",
            KernelPhase::DeviceAlloc => "device allocation",
            KernelPhase::Execute => "execute",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum AscendOpsError {
    #[error("{op}: invalid argument `{argument}`: expected {expected}, got {actual}")]
    InvalidArgument {
        op: &'static str,
        argument: &'static str,
        expected: String,
        actual: String,
    },

    #[error("{op}: failed to create tensor descriptor for `{argument}`")]
    DescriptorCreation {
        op: &'static str,
        argument: &'static str,
    },

    #[error("{op}: kernel {phase} phase failed (status {code}){message}")]
    KernelExecution {
        op: &'static str,
        phase: KernelPhase,
        code: i32,
        message: String,
    },

    #[error("{op}: failed to destroy tensor descriptor for `{argument}` (status {code})")]
    Teardown {
        op: &'static str,
        argument: &'static str,
        code: i32,
    },

    #[error("invalid environment variable `{name}`: {message}")]
    InvalidEnvironment { name: &'static str, message: String },

    #[error("failed to load shared library `{library}`: {message}")]
    LibraryLoad { library: PathBuf, message: String },

    #[error("failed to resolve symbol `{symbol}` from `{library}`: {message}")]
    SymbolResolve {
        library: PathBuf,
        symbol: &'static str,
        message: String,
    },

    #[error("runtime has already been initialized with a different configuration")]
    RuntimeAlreadyInitialized,

    #[cfg(feature = "aclrt")]
    #[error("ACL runtime call `{api}` failed (status {code})")]
    Aclrt { api: &'static str, code: i32 },
}

impl AscendOpsError {
    pub(crate) fn invalid_argument(
        op: &'static str,
        argument: &'static str,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::InvalidArgument {
            op,
            argument,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub(crate) fn kernel_execution(
        op: &'static str,
        phase: KernelPhase,
        code: i32,
        detail: String,
    ) -> Self {
        let message = if detail.is_empty() {
            String::new()
        } else {
            format!(": {detail}")
        };
        Self::KernelExecution {
            op,
            phase,
            code,
            message,
        }
    }
}
