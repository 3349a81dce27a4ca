/// Converts a `Result` into an `Option`, logging the error instead of
/// propagating it.
///
/// Worker-side code must degrade to "field missing" rather than abort
/// an episode or the host process; these helpers keep those paths
/// one-liners.
pub trait ResultOkLogExt<T, E> {
    /// Logs the error at `error` level and discards it.
    fn ok_log(self) -> Option<T>;

    /// Like [`ResultOkLogExt::ok_log`], prefixing the log line with a
    /// short description of what was being attempted.
    fn ok_log_msg(self, what: &str) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T, E> for std::result::Result<T, E>
where
    E: std::error::Error,
{
    fn ok_log(self) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::error!("{err}");
                None
            }
        }
    }

    fn ok_log_msg(self, what: &str) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::error!("{what}: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_log_passes_through_ok() {
        let result: Result<u32, std::num::ParseIntError> = "42".parse();
        assert_eq!(result.ok_log(), Some(42));
    }

    #[test]
    fn test_ok_log_msg_discards_err() {
        let result: Result<u32, std::num::ParseIntError> = "nope".parse();
        assert_eq!(result.ok_log_msg("parsing test input"), None);
    }
}
