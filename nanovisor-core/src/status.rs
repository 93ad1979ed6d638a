//! Kernel error type and its mapping onto ABI status words

use nanovisor_hal::abi;
use nanovisor_hal::intrinsic::IntrinsicError;

/// Every fallible kernel operation returns one of these. The variants map
/// 1:1 onto the status words the extension sees in its return register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkError {
    /// Precondition violated with no dedicated code
    Unknown,
    /// Handle missing or wrong
    InvalidHandle,
    /// Well-formed request the kernel refuses
    Unsupported,
    /// A pool (page, huge or object) is exhausted
    OutOfMemory,
    /// The virtual address is already mapped. Not an error to callers that
    /// map on demand; everyone else treats it as one.
    AlreadyExists,
    /// Which syscall argument was malformed (1-based)
    InvalidParams1,
    InvalidParams2,
    InvalidParams3,
    InvalidParams4,
    InvalidParams5,
}

/// Kernel result alias
pub type MkResult<T> = Result<T, MkError>;

impl MkError {
    /// The ABI status word for this error.
    pub const fn to_status(self) -> abi::BfStatus {
        match self {
            Self::Unknown => abi::BF_STATUS_FAILURE_UNKNOWN,
            Self::InvalidHandle => abi::BF_STATUS_FAILURE_INVALID_HANDLE,
            Self::Unsupported => abi::BF_STATUS_FAILURE_UNSUPPORTED,
            Self::OutOfMemory => abi::BF_STATUS_FAILURE_OUT_OF_MEMORY,
            // an unexpected collision has no dedicated ABI code
            Self::AlreadyExists => abi::BF_STATUS_FAILURE_UNKNOWN,
            Self::InvalidParams1 => abi::BF_STATUS_INVALID_PARAMS1,
            Self::InvalidParams2 => abi::BF_STATUS_INVALID_PARAMS2,
            Self::InvalidParams3 => abi::BF_STATUS_INVALID_PARAMS3,
            Self::InvalidParams4 => abi::BF_STATUS_INVALID_PARAMS4,
            Self::InvalidParams5 => abi::BF_STATUS_INVALID_PARAMS5,
        }
    }
}

impl From<IntrinsicError> for MkError {
    fn from(_: IntrinsicError) -> Self {
        Self::Unknown
    }
}
