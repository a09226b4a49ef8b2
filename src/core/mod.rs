//! 基础设施：错误分类、优雅关闭、Webhook 签名

pub mod error;
pub mod shutdown;
pub mod signature;

pub use error::{DispatchError, ErrorKind, StoreError};
pub use shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use signature::Signer;
