//! Status code resolution for terminal events

use std::error::Error;
use tonic::{Code, Status};

/// Code a call result is reported with
pub fn status_code<T>(result: &Result<T, Status>) -> Code {
    match result {
        Ok(_) => Code::Ok,
        Err(status) => status.code(),
    }
}

/// Code carried by an arbitrary error
///
/// Walks the source chain looking for a `tonic::Status`; errors that carry
/// none are labeled `Unknown`.
pub fn code_from_error(err: &(dyn Error + 'static)) -> Code {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(status) = e.downcast_ref::<Status>() {
            return status.code();
        }
        current = e.source();
    }
    Code::Unknown
}
