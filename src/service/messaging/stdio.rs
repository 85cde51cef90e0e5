use super::*;
use tokio::{
    io::{AsyncWriteExt, Stdout},
    sync::Mutex,
};

/// One outbound message as written to stdout
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundLine<'a> {
    tab_id: TabId,
    command: &'a TabCommand,
}

/// Hands commands to the host process as JSON lines on stdout.
///
/// Delivery is fire-and-forget: the host answers tabs on its own, so every
/// successfully written command is answered with `null`.
pub struct StdioTabMessenger {
    stdout: Mutex<Stdout>,
}

impl StdioTabMessenger {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Write `value` as a single JSON line
    pub async fn write_line<T: Serialize>(&self, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        let mut stdout = self.stdout.lock().await;
        stdout.write_all(&line).await?;
        stdout.flush().await?;
        Ok(())
    }
}

impl Default for StdioTabMessenger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TabMessenger for StdioTabMessenger {
    async fn send_message(&self, tab_id: TabId, command: &TabCommand) -> Result<Value> {
        self.write_line(&OutboundLine { tab_id, command }).await?;
        debug!(tab_id, ?command, "command sent");
        Ok(Value::Null)
    }
}
