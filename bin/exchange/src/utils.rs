use std::{fmt::Debug, time::Duration};

use tokio::select;
use tokio_util::sync::CancellationToken;

pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Pause after a failed `accept` before retrying, cut short by `cancel`.
pub async fn accept_backoff(cancel: &CancellationToken) {
    select! {
        _ = cancel.cancelled() => {},
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {},
    }
}

pub trait ErrorExt {
    fn print_on_err(&self, prefix: &str);
}

impl<T, E: Debug> ErrorExt for Result<T, E> {
    fn print_on_err(&self, prefix: &str) {
        if let Err(e) = self {
            log::error!("{prefix} got error {e:?}")
        }
    }
}
