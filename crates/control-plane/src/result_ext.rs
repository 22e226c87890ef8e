//! Result extension traits for logging failures with caller location.

use std::fmt::Display;
use tracing::error;

/// Adds `log` to `Result`: an `Err` is logged with the given context and the
/// caller's source location, then returned unchanged.
///
/// ```ignore
/// use policy_engine_control_plane::result_ext::ResultExt;
///
/// let status = backend.status(&id).await.log("polling task status")?;
/// ```
pub trait ResultExt<T, E> {
    fn log<S: ToString>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            error!(
                target: "policy_engine_control_plane",
                error = %e,
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_ext_passes_through() {
        let ok: Result<i32, &str> = Ok(42);
        assert_eq!(ok.log("test context").unwrap(), 42);

        let err: Result<i32, &str> = Err("test error");
        assert_eq!(err.log("test context").unwrap_err(), "test error");
    }
}
