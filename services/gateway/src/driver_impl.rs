//! Channel-backed session driver
//!
//! The automation peer on the other end of the WebSocket owns the real
//! browser sessions. Activating an account means telling that peer to
//! switch; the driver's only levers are control frames on the channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use common::Secret;
use driver::{ControlEvent, Credentials, DriverError, SessionDriver};
use tracing::{debug, warn};

use crate::config::AccountConfig;
use crate::registry::Registry;

pub struct ChannelDriver {
    registry: Arc<Registry>,
    accounts: Vec<AccountConfig>,
}

impl ChannelDriver {
    pub fn new(registry: Arc<Registry>, accounts: Vec<AccountConfig>) -> Self {
        Self { registry, accounts }
    }

    fn account(&self, index: usize) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.index == index)
    }
}

impl SessionDriver for ChannelDriver {
    fn id(&self) -> &str {
        "channel"
    }

    fn launch_or_switch_context(
        &self,
        index: usize,
    ) -> Pin<Box<dyn Future<Output = driver::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.account(index).is_none() {
                return Err(DriverError::Activation(format!(
                    "no account configured for index {index}"
                )));
            }
            let delivered = self.registry.broadcast(&ControlEvent::SwitchAccount { index });
            if delivered == 0 {
                warn!(index, "no channel reachable to deliver account switch");
                return Err(DriverError::NoChannel(index));
            }
            debug!(index, delivered, "account switch signalled");
            Ok(())
        })
    }

    fn close_context(
        &self,
        index: usize,
    ) -> Pin<Box<dyn Future<Output = driver::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let delivered = self.registry.broadcast(&ControlEvent::CloseContext { index });
            if delivered == 0 {
                return Err(DriverError::NoChannel(index));
            }
            Ok(())
        })
    }

    fn save_context_state(
        &self,
        index: usize,
    ) -> Pin<Box<dyn Future<Output = driver::Result<()>> + Send + '_>> {
        // The automation peer persists its own session state when it
        // handles a switch; nothing to do on this side.
        let _ = index;
        Box::pin(async { Ok(()) })
    }

    fn get_auth(
        &self,
        index: usize,
    ) -> Pin<Box<dyn Future<Output = Option<Credentials>> + Send + '_>> {
        Box::pin(async move {
            let account = self.account(index)?;
            let env_name = account.token_env.as_deref()?;
            match Secret::from_env(env_name) {
                Some(token) => Some(Credentials {
                    account_id: account.id.clone(),
                    token,
                }),
                None => {
                    debug!(index, env = env_name, "no token available for account");
                    None
                }
            }
        })
    }

    fn rotation_candidates(&self) -> Vec<usize> {
        self.accounts.iter().map(|a| a.index).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn accounts() -> Vec<AccountConfig> {
        vec![
            AccountConfig {
                index: 0,
                id: "primary".into(),
                token_env: None,
            },
            AccountConfig {
                index: 1,
                id: "secondary".into(),
                token_env: Some("SWITCHBOARD_TEST_TOKEN".into()),
            },
        ]
    }

    fn driver_with_connection() -> (ChannelDriver, mpsc::UnboundedReceiver<String>) {
        let registry = Arc::new(Registry::new(Duration::from_secs(15)));
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(0, tx);
        (ChannelDriver::new(registry, accounts()), rx)
    }

    #[tokio::test]
    async fn launch_broadcasts_switch_account() {
        let (driver, mut rx) = driver_with_connection();
        driver.launch_or_switch_context(1).await.unwrap();

        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event_type"], "switch_account");
        assert_eq!(value["index"], 1);
    }

    #[tokio::test]
    async fn launch_fails_without_any_channel() {
        let registry = Arc::new(Registry::new(Duration::from_secs(15)));
        let driver = ChannelDriver::new(registry, accounts());
        match driver.launch_or_switch_context(0).await {
            Err(DriverError::NoChannel(0)) => {}
            other => panic!("expected NoChannel, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn launch_rejects_unknown_account_index() {
        let (driver, _rx) = driver_with_connection();
        match driver.launch_or_switch_context(7).await {
            Err(DriverError::Activation(msg)) => assert!(msg.contains("7")),
            other => panic!("expected Activation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_context_broadcasts_close_frame() {
        let (driver, mut rx) = driver_with_connection();
        driver.close_context(0).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("close_context"));
    }

    #[tokio::test]
    async fn rotation_candidates_follow_config_order() {
        let (driver, _rx) = driver_with_connection();
        assert_eq!(driver.rotation_candidates(), vec![0, 1]);
    }

    #[tokio::test]
    async fn get_auth_without_token_env_is_none() {
        let (driver, _rx) = driver_with_connection();
        assert!(driver.get_auth(0).await.is_none());
    }
}
