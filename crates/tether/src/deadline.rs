//! Deadlines for remote work
//!
//! A file operation holding a remote handle cannot simply be dropped when
//! its timeout fires: the handle would stay open on the shared channel. The
//! operation instead runs each step under a [`Deadline`] and closes its
//! handle afterwards, whatever the outcome.

use crate::{ClientError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::warn;

/// How long closing a remote handle may take once its work is over
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Point in time an operation has to finish by, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<(Instant, Duration)>,
}

impl Deadline {
    /// No deadline
    pub fn none() -> Self {
        Self { at: None }
    }

    /// A deadline `timeout` from now; none without a timeout
    pub fn after(timeout: Option<Duration>) -> Self {
        Self {
            at: timeout.map(|duration| (Instant::now() + duration, duration)),
        }
    }

    /// The timeout this deadline was created from
    pub fn duration(&self) -> Option<Duration> {
        self.at.map(|(_, duration)| duration)
    }

    /// Run `work`, failing with [`ClientError::Timeout`] once the deadline passes
    pub async fn run<T, E, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        ClientError: From<E>,
    {
        match self.at {
            Some((at, duration)) => match timeout_at(at, work).await {
                Ok(result) => result.map_err(ClientError::from),
                Err(_) => Err(ClientError::Timeout { duration }),
            },
            None => work.await.map_err(ClientError::from),
        }
    }

    /// Close a remote handle, bounded by [`CLOSE_GRACE`] rather than the deadline
    pub async fn close<E, F>(what: &str, close: F) -> Result<()>
    where
        F: Future<Output = std::result::Result<(), E>>,
        ClientError: From<E>,
    {
        match timeout(CLOSE_GRACE, close).await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => {
                warn!("Closing {} took longer than {:?}", what, CLOSE_GRACE);
                Err(ClientError::Timeout {
                    duration: CLOSE_GRACE,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_ssh::{SftpError, StatusCode};

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let deadline = Deadline::after(Some(Duration::from_secs(2)));
        let err = deadline
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, SftpError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Timeout { duration: Duration::from_secs(2) });
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_shared_by_steps() {
        let deadline = Deadline::after(Some(Duration::from_secs(3)));
        let first = deadline
            .run(async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<_, ClientError>(1)
            })
            .await;
        assert_eq!(first, Ok(1));

        // Only one second of the budget is left.
        let second = deadline
            .run(async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<_, ClientError>(2)
            })
            .await;
        assert!(second.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_errors_are_converted() {
        let err = Deadline::none()
            .run(async { Err::<(), _>(SftpError::new(StatusCode::NoSuchFile, "gone")) })
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Remote(_)));
        assert_eq!(Deadline::none().duration(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_bounded() {
        let err = Deadline::close("handle", std::future::pending::<std::result::Result<(), SftpError>>())
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::Timeout { duration: CLOSE_GRACE });
    }
}
