use async_trait::async_trait;

use crate::domain::Jid;
use crate::Result;

/// Cross-channel port. Telegram is the only concrete implementation in this
/// workspace; WhatsApp and others fit behind the same four methods.
#[async_trait]
pub trait ChannelPort: Send + Sync {
    /// Stable name for logging, e.g. `"telegram"`.
    fn name(&self) -> &str;

    /// Whether this adapter is the one that should deliver to `jid`. The
    /// router asks each registered adapter in turn; the first `true` wins.
    fn owns_jid(&self, jid: &Jid) -> bool;

    async fn send_message(&self, jid: &Jid, text: &str) -> Result<()>;

    /// Typing indicator. Optional — adapters that can't express one just
    /// return `Ok(())`.
    async fn set_typing(&self, jid: &Jid, on: bool) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}
