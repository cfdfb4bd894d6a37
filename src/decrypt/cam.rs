//! CAM dispatcher (§3 "CAM Dispatcher", §4.5): sends ECMs to a primary CAM,
//! hedging to a backup after `hedge_ms` if configured. The on-the-wire CAM
//! protocol is out of scope (§1 Non-goals) — `CamClient` is the seam an
//! embedder implements against their actual CAM transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{Result, TsRelayError};

/// Outcome of sending one ECM to a CAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcmResponse {
    /// Keys found: two 8-byte control words (§3 step 3).
    Found { even_cw: [u8; 8], odd_cw: [u8; 8] },
    NotFound,
}

/// An external CAM connection. Implementors own their own wire framing.
#[async_trait]
pub trait CamClient: Send + Sync {
    async fn send_ecm(&self, ecm_pid: u16, ecm_data: &[u8]) -> Result<EcmResponse>;
}

/// Dispatches ECMs to a primary CAM, with optional hedged backup (§3 step
/// 2, §4.5 "CAM Dispatcher"). The first CAM to answer "found" wins; the
/// caller finds out which one via `via_backup` so it can track the right
/// counter (§6 `ok_primary`/`ok_backup`).
pub struct CamDispatcher {
    primary: Arc<dyn CamClient>,
    backup: Option<Arc<dyn CamClient>>,
    hedge_ms: u64,
}

/// Result of one dispatched ECM: the response, which CAM answered, and the
/// round-trip time measured from the initial send.
pub struct DispatchResult {
    pub response: EcmResponse,
    pub via_backup: bool,
    pub rtt: Duration,
}

impl CamDispatcher {
    pub fn new(primary: Arc<dyn CamClient>, backup: Option<Arc<dyn CamClient>>, hedge_ms: u64) -> Self {
        CamDispatcher { primary, backup, hedge_ms }
    }

    /// Sends `ecm_data` to the primary CAM; if a backup is configured and
    /// `hedge_ms > 0`, races a backup send started `hedge_ms` after the
    /// primary unless the primary has already answered (§3 step 2).
    pub async fn dispatch_ecm(&self, ecm_pid: u16, ecm_data: &[u8]) -> Result<DispatchResult> {
        let start = Instant::now();
        let primary = self.primary.clone();
        let ecm = ecm_data.to_vec();
        let primary_fut = {
            let primary = primary.clone();
            let ecm = ecm.clone();
            async move { primary.send_ecm(ecm_pid, &ecm).await }
        };

        let Some(backup) = self.backup.clone().filter(|_| self.hedge_ms > 0) else {
            let response = primary_fut.await?;
            return Ok(DispatchResult { response, via_backup: false, rtt: start.elapsed() });
        };

        tokio::pin!(primary_fut);
        let hedge_delay = tokio::time::sleep(Duration::from_millis(self.hedge_ms));
        tokio::pin!(hedge_delay);

        tokio::select! {
            primary_result = &mut primary_fut => {
                let response = primary_result?;
                Ok(DispatchResult { response, via_backup: false, rtt: start.elapsed() })
            }
            _ = &mut hedge_delay => {
                let backup_fut = backup.send_ecm(ecm_pid, &ecm);
                tokio::pin!(backup_fut);
                tokio::select! {
                    primary_result = &mut primary_fut => {
                        let response = primary_result?;
                        Ok(DispatchResult { response, via_backup: false, rtt: start.elapsed() })
                    }
                    backup_result = &mut backup_fut => {
                        let response = backup_result?;
                        Ok(DispatchResult { response, via_backup: true, rtt: start.elapsed() })
                    }
                }
            }
        }
    }
}

/// A CAM that always fails to answer, used to exercise the "CAM lost"
/// failure path (§3 "Failure semantics") in tests.
pub struct DeadCam;

#[async_trait]
impl CamClient for DeadCam {
    async fn send_ecm(&self, _ecm_pid: u16, _ecm_data: &[u8]) -> Result<EcmResponse> {
        Err(TsRelayError::EcmNotFound(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Duration as TokioDuration;

    struct FixedCam {
        delay_ms: u64,
        response: EcmResponse,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CamClient for FixedCam {
        async fn send_ecm(&self, _ecm_pid: u16, _ecm_data: &[u8]) -> Result<EcmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(TokioDuration::from_millis(self.delay_ms)).await;
            Ok(self.response.clone())
        }
    }

    #[tokio::test]
    async fn fast_primary_answers_without_hedging_backup() {
        let primary = Arc::new(FixedCam {
            delay_ms: 5,
            response: EcmResponse::Found { even_cw: [1; 8], odd_cw: [2; 8] },
            calls: AtomicU32::new(0),
        });
        let backup = Arc::new(FixedCam { delay_ms: 5, response: EcmResponse::NotFound, calls: AtomicU32::new(0) });
        let dispatcher = CamDispatcher::new(primary.clone(), Some(backup.clone()), 100);

        let result = dispatcher.dispatch_ecm(0x100, &[0u8; 4]).await.unwrap();
        assert!(!result.via_backup);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_primary_hedges_to_backup() {
        let primary = Arc::new(FixedCam { delay_ms: 500, response: EcmResponse::NotFound, calls: AtomicU32::new(0) });
        let backup = Arc::new(FixedCam {
            delay_ms: 5,
            response: EcmResponse::Found { even_cw: [3; 8], odd_cw: [4; 8] },
            calls: AtomicU32::new(0),
        });
        let dispatcher = CamDispatcher::new(primary, Some(backup.clone()), 20);

        let result = dispatcher.dispatch_ecm(0x100, &[0u8; 4]).await.unwrap();
        assert!(result.via_backup);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_backup_configured_waits_on_primary_only() {
        let primary = Arc::new(FixedCam {
            delay_ms: 5,
            response: EcmResponse::Found { even_cw: [1; 8], odd_cw: [2; 8] },
            calls: AtomicU32::new(0),
        });
        let dispatcher = CamDispatcher::new(primary, None, 50);
        let result = dispatcher.dispatch_ecm(0x100, &[0u8; 4]).await.unwrap();
        assert!(!result.via_backup);
    }
}
