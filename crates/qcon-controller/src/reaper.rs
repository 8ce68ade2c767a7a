use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::FutureExt;
use tokio::{task::JoinHandle, time::Instant};

use crate::{controller::IDLE_TIMEOUT, Controller};

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Starts the idle reaper.
///
/// The task never returns on its own; a panicking sweep is logged and the next one runs on
/// schedule. Callers should treat the handle completing as fatal.
pub fn spawn(controller: Arc<Controller>) -> JoinHandle<()> {
    spawn_with(controller, SWEEP_INTERVAL, IDLE_TIMEOUT)
}

pub fn spawn_with(
    controller: Arc<Controller>,
    interval: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    spawn_sweeps(interval, move || {
        let controller = Arc::clone(&controller);
        async move { controller.reap_idle(Instant::now(), idle_timeout).await }
    })
}

/// Runs `sweep` every `interval`; each sweep resolves to the number of instances it reaped.
fn spawn_sweeps<F, Fut>(interval: Duration, mut sweep: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = usize> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            match AssertUnwindSafe(sweep()).catch_unwind().await {
                Ok(0) => tracing::trace!("idle sweep found nothing"),
                Ok(reaped) => tracing::info!(reaped, "idle sweep finished"),
                Err(_) => tracing::error!("idle sweep panicked"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::ControllerConfig;

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_schedule_until_aborted() {
        let controller = Arc::new(
            Controller::new(ControllerConfig::new("/q", "/i", "/v", "s")).unwrap(),
        );
        let reaper = spawn_with(controller, Duration::from_secs(60), IDLE_TIMEOUT);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(!reaper.is_finished());

        reaper.abort();
        assert!(reaper.await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_sweep_does_not_stop_the_reaper() {
        let sweeps = Arc::new(AtomicUsize::new(0));
        let reaper = spawn_sweeps(Duration::from_secs(60), {
            let sweeps = Arc::clone(&sweeps);
            move || {
                let n = sweeps.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        panic!("sweep failed");
                    }
                    n
                }
            }
        });

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(sweeps.load(Ordering::SeqCst) >= 2);
        assert!(!reaper.is_finished());

        reaper.abort();
        assert!(reaper.await.unwrap_err().is_cancelled());
    }
}
