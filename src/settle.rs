//! Waiting for eventually-consistent propagation.
//!
//! After a principal, an application template or a signing certificate is
//! created, dependent calls can fail for a while because the change has not
//! reached every replica yet. A [`Settler`] sits between the create and the
//! dependent call. In `fixed` mode it sleeps; in `poll` mode it checks a
//! visibility condition with bounded exponential backoff.

use std::{future::Future, time::Duration};

use crate::config::{SettleConfig, SettleMode, SettlePoint};

#[derive(Debug, Clone)]
pub struct Settler {
    config: SettleConfig,
}

impl Settler {
    pub fn new(config: SettleConfig) -> Self {
        Self { config }
    }

    /// A settler that never waits.
    pub fn immediate() -> Self {
        Self::new(SettleConfig::immediate())
    }

    pub fn mode(&self) -> SettleMode {
        self.config.mode
    }

    /// Wait at a settle point.
    ///
    /// In `poll` mode `visible` is called until it returns `true` or the
    /// attempt budget runs out; a check that errors counts as "not yet".
    /// Returns whether the condition was observed (always `true` in `fixed`
    /// mode). The caller proceeds either way.
    pub async fn wait<F, Fut, E>(&self, point: SettlePoint, label: &str, mut visible: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: std::fmt::Display,
    {
        match self.config.mode {
            SettleMode::Fixed => {
                let delay = self.config.delay_for(point);
                if !delay.is_zero() {
                    tracing::info!(
                        settle_point = %point,
                        resource = label,
                        delay_secs = delay.as_secs(),
                        "Waiting for propagation"
                    );
                    tokio::time::sleep(delay).await;
                }
                true
            }
            SettleMode::Poll => self.poll(point, label, &mut visible).await,
        }
    }

    async fn poll<F, Fut, E>(&self, point: SettlePoint, label: &str, visible: &mut F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: std::fmt::Display,
    {
        let poll = &self.config.poll;
        for attempt in 0..poll.max_attempts {
            match visible().await {
                Ok(true) => {
                    tracing::debug!(settle_point = %point, resource = label, attempt, "Visible");
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(
                        settle_point = %point,
                        resource = label,
                        attempt,
                        error = %e,
                        "Visibility check failed"
                    );
                }
            }

            if attempt + 1 < poll.max_attempts {
                let delay = poll.delay_for_attempt(attempt);
                sleep_unless_zero(delay).await;
            }
        }

        tracing::warn!(
            settle_point = %point,
            resource = label,
            attempts = poll.max_attempts,
            "Resource still not visible, continuing"
        );
        false
    }
}

async fn sleep_unless_zero(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;
    use crate::config::PollConfig;

    fn polling(max_attempts: u32) -> Settler {
        let mut config = SettleConfig::immediate();
        config.mode = SettleMode::Poll;
        config.poll = PollConfig {
            max_attempts,
            ..config.poll
        };
        Settler::new(config)
    }

    #[tokio::test]
    async fn test_fixed_mode_does_not_check() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let observed = Settler::immediate()
            .wait(SettlePoint::Principal, "id-opencti-001", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(false)
                }
            })
            .await;

        assert!(observed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_poll_stops_when_visible() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let observed = polling(10)
            .wait(SettlePoint::Principal, "id-opencti-001", || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err("replica lag".to_string())
                    } else {
                        Ok(n >= 2)
                    }
                }
            })
            .await;

        assert!(observed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let observed = polling(4)
            .wait(SettlePoint::Certificate, "OpenCTI", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(false)
                }
            })
            .await;

        assert!(!observed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
