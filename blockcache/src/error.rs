use thiserror::Error;

/// A list of possible errors returned by this crate.
///
/// Cache operations themselves are infallible; only configuration is
/// validated.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Some option value is invalid.
    #[error("Invalid argument")]
    InvalidArgument,
}

/// A specialized [`Result`] type returned by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
