use super::*;
use crate::{
    event::HostMessage,
    service::{messaging::StdioTabMessenger, LoopService, ServiceControl},
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

/// Answer to one host line; popup intents carry no tab id
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyLine<R> {
    #[serde(skip_serializing_if = "Option::is_none")]
    tab_id: Option<TabId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<R>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<R> ReplyLine<R> {
    fn new(tab_id: Option<TabId>, result: Result<R>) -> Self {
        match result {
            Ok(response) => Self {
                tab_id,
                response: Some(response),
                error: None,
            },
            Err(e) => {
                warn!(?tab_id, error = %e, "request failed");
                Self {
                    tab_id,
                    response: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Reads host messages from stdin, one JSON object per line, and
/// answers each on stdout.
///
/// A line is either a tab request (`{"tabId": .., "request": {..}}`) or
/// a popup intent (`{"intent": {"action": ..}}`).
///
/// Stdin closing means the host went away, which stops all services.
pub struct StdioBridge {
    popup: SharedPopup,
    output: Arc<StdioTabMessenger>,
    lines: Lines<BufReader<Stdin>>,
    svc_ctl: ServiceControl,
}

impl StdioBridge {
    pub fn new(popup: SharedPopup, output: Arc<StdioTabMessenger>, svc_ctl: ServiceControl) -> Self {
        Self {
            popup,
            output,
            lines: BufReader::new(tokio::io::stdin()).lines(),
            svc_ctl,
        }
    }

    async fn handle_line(&self, line: &str) -> Result<()> {
        let message: HostMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "ignoring malformed request");
                return Ok(());
            }
        };

        match message {
            HostMessage::Tab(envelope) => {
                let tab_id = envelope.tab_id;
                let result = self.popup.handle_request(tab_id, envelope.request).await;
                self.output.write_line(&ReplyLine::new(Some(tab_id), result)).await
            }
            HostMessage::Popup { intent } => {
                let result = self.popup.handle_intent(intent).await;
                self.output.write_line(&ReplyLine::new(None, result)).await
            }
        }
    }
}

#[async_trait::async_trait]
impl LoopService for StdioBridge {
    fn name(&self) -> &'static str {
        "stdio-bridge"
    }

    fn interval(&self) -> Duration {
        Duration::ZERO
    }

    async fn run_iteration(&mut self) -> Result<()> {
        match self.lines.next_line().await? {
            Some(line) if line.trim().is_empty() => Ok(()),
            Some(line) => self.handle_line(&line).await,
            None => {
                info!("host closed stdin, stopping");
                self.svc_ctl.stop_all();
                Ok(())
            }
        }
    }
}
