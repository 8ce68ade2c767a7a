use std::{io, time::Duration};

use tokio::process::Child;

use crate::InstanceError;

/// How long [`terminate`] keeps polling a signalled child before giving up on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillBudget {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for KillBudget {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(100),
        }
    }
}

impl KillBudget {
    pub fn total(self) -> Duration {
        self.interval * self.attempts
    }
}

// Linux errno values.
const ESRCH: i32 = 3;
const ECHILD: i32 = 10;

/// Signals `child` and polls until it has exited.
///
/// A child that is already gone counts as terminated. A child still running once `budget` is
/// used up is a [`InstanceError::KillDeadline`].
pub(crate) async fn terminate(
    child: &mut Child,
    process: &'static str,
    budget: KillBudget,
) -> Result<(), InstanceError> {
    if let Ok(Some(_)) = child.try_wait() {
        return Ok(());
    }

    if let Err(err) = child.start_kill() {
        if is_gone(&err) {
            return Ok(());
        }
        return Err(InstanceError::Signal {
            process,
            source: err,
        });
    }

    for _ in 0..budget.attempts {
        tokio::time::sleep(budget.interval).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(process, %status, "process exited");
                return Ok(());
            }
            Ok(None) => {}
            Err(err) if is_gone(&err) => return Ok(()),
            Err(err) => tracing::debug!(process, "polling exit status failed: {err}"),
        }
    }

    Err(InstanceError::KillDeadline {
        process,
        budget: budget.total(),
    })
}

/// Whether a child is still running. Errors while polling count as not running.
pub(crate) fn is_running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

fn is_gone(err: &io::Error) -> bool {
    // tokio reports `InvalidInput` when the child was already reaped.
    err.kind() == io::ErrorKind::InvalidInput
        || matches!(err.raw_os_error(), Some(ESRCH) | Some(ECHILD))
}
