//! Extensions for results whose errors are only worth logging.

/// Extension methods for [`Result`] used on best-effort code paths.
pub trait ResultExt<T, E: std::fmt::Display> {
    /// Return the Ok value, or log the error at warning level and return the default.
    fn log_err_default(self) -> T
    where
        T: Default;

    /// Log the error (if any) at warning level, prefixed with `msg`.
    fn log_err_with(self, msg: &str);
}

impl<T, E: std::fmt::Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log_err_default(self) -> T
    where
        T: Default,
    {
        match self {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("{e}");
                Default::default()
            }
        }
    }

    #[track_caller]
    fn log_err_with(self, msg: &str) {
        if let Err(e) = self {
            tracing::warn!("{msg}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_err_default() {
        let r: Result<u32, &str> = Err("oops");
        assert_eq!(r.log_err_default(), 0);
        let r: Result<u32, &str> = Ok(5);
        assert_eq!(r.log_err_default(), 5);
    }
}
