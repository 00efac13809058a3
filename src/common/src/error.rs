use thiserror::Error;

/// The error taxonomy every fallible operation in the injector and the
/// in-process agent ultimately bottoms out in. Call sites wrap this in
/// `anyhow::Error` and add `.context(...)` as it propagates; a caller that
/// needs to match on the kind recovers it with
/// `err.downcast_ref::<CoreError>()`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("decoder failure: {0}")]
    DecoderFailure(String),

    #[error("allocator mismatch: {0}")]
    AllocatorMismatch(String),

    #[error("hook prepare failure: {0}")]
    HookPrepareFailure(String),

    #[error("hook arm failure: {0}")]
    HookArmFailure(String),
}
