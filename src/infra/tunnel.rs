//! Scoped port-forward
//!
//! The guard owns the stop channel of a port-forward. The channel is
//! signalled once, by `close` or on drop, whichever comes first.

use tokio::sync::oneshot;
use tracing::debug;

use super::{ControlPlane, InfraError, PortForwardTarget};

pub struct TunnelGuard {
    target: PortForwardTarget,
    stop: Option<oneshot::Sender<()>>,
}

impl TunnelGuard {
    /// Open a port-forward that lives as long as the guard
    pub async fn open(
        control_plane: &dyn ControlPlane,
        target: PortForwardTarget,
    ) -> Result<Self, InfraError> {
        let (tx, rx) = oneshot::channel();
        control_plane.open_port_forward(&target, rx).await?;
        Ok(Self {
            target,
            stop: Some(tx),
        })
    }

    pub fn target(&self) -> &PortForwardTarget {
        &self.target
    }

    pub fn is_open(&self) -> bool {
        self.stop.is_some()
    }

    pub fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            // The forwarding task may already be gone
            let _ = stop.send(());
            debug!(
                "closed tunnel to {}/{}",
                self.target.namespace, self.target.pod
            );
        }
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::kubectl::mock::MockControlPlane;

    #[tokio::test]
    async fn test_close_then_drop_signals_once() {
        let cp = MockControlPlane::default();
        let mut guard = TunnelGuard::open(&cp, PortForwardTarget::vault())
            .await
            .unwrap();
        assert!(guard.is_open());
        assert!(!cp.tunnel_closed());

        guard.close();
        assert!(!guard.is_open());
        assert!(cp.tunnel_closed());

        guard.close();
        drop(guard);
        assert!(cp.tunnel_closed());
    }

    #[tokio::test]
    async fn test_drop_closes() {
        let cp = MockControlPlane::default();
        {
            let _guard = TunnelGuard::open(&cp, PortForwardTarget::vault())
                .await
                .unwrap();
        }
        assert!(cp.tunnel_closed());
    }

    #[tokio::test]
    async fn test_open_failure_returns_no_guard() {
        let cp = MockControlPlane::failing_on("open_port_forward");
        let result = TunnelGuard::open(&cp, PortForwardTarget::vault()).await;
        assert!(result.is_err());
        assert!(!cp.tunnel_closed());
    }
}
