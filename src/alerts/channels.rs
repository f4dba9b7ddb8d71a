use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::AlertEvent;
use super::dispatch::Channel;
use super::rules::{ChannelKind, Severity};
use crate::config::{ChannelsConfig, SlackConfig, SmsConfig, TelegramConfig};
use crate::error::DeliveryError;

const TELEGRAM_API: &str = "https://api.telegram.org";
const TWILIO_API: &str = "https://api.twilio.com";

/// Map a non-2xx provider status to a delivery error.
fn status_error(status: u16, body: String) -> DeliveryError {
    match status {
        401 | 403 => DeliveryError::Auth(status),
        429 => DeliveryError::RateLimited,
        _ => DeliveryError::Http { status, body },
    }
}

async fn check(resp: reqwest::Response) -> Result<(), DeliveryError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status.as_u16(), body))
}

/// Telegram Bot API `sendMessage`.
pub struct TelegramChannel {
    client: Client,
    url: String,
    chat_id: String,
}

impl TelegramChannel {
    pub fn new(client: Client, api_base: &str, bot_token: &str, chat_id: &str) -> Self {
        Self {
            client,
            url: format!("{}/bot{bot_token}/sendMessage", api_base.trim_end_matches('/')),
            chat_id: chat_id.to_string(),
        }
    }

    fn from_config(client: &Client, config: &TelegramConfig) -> Option<Self> {
        let token = config.bot_token.as_deref()?;
        let chat_id = config.chat_id.as_deref()?;
        let base = config.api_base.as_deref().unwrap_or(TELEGRAM_API);
        Some(Self::new(client.clone(), base, token, chat_id))
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": event.message,
            }))
            .send()
            .await?;
        check(resp).await
    }
}

/// Slack incoming webhook.
pub struct SlackChannel {
    client: Client,
    webhook_url: String,
}

impl SlackChannel {
    pub fn new(client: Client, webhook_url: &str) -> Self {
        Self {
            client,
            webhook_url: webhook_url.to_string(),
        }
    }

    fn from_config(client: &Client, config: &SlackConfig) -> Option<Self> {
        Some(Self::new(client.clone(), config.webhook_url.as_deref()?))
    }

    fn payload(event: &AlertEvent) -> serde_json::Value {
        let color = if event.severity == Severity::Critical {
            "#ff0000"
        } else {
            "#36a64f"
        };
        json!({
            "text": event.message,
            "attachments": [{
                "color": color,
                "fields": [
                    { "title": "Branch", "value": event.branch, "short": true },
                    { "title": "Rule", "value": event.rule, "short": true },
                    { "title": "Severity", "value": event.severity.as_str(), "short": true },
                ],
                "ts": event.created_at.timestamp(),
            }],
        })
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Slack
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&Self::payload(event))
            .send()
            .await?;
        check(resp).await
    }
}

/// Twilio Messages API, one request per recipient.
pub struct SmsChannel {
    client: Client,
    url: String,
    auth: String, // base64 encoded sid:token
    from: String,
    to: Vec<String>,
}

impl SmsChannel {
    pub fn new(
        client: Client,
        api_base: &str,
        account_sid: &str,
        auth_token: &str,
        from: &str,
        to: Vec<String>,
    ) -> Self {
        use base64::{Engine, engine::general_purpose::STANDARD};
        Self {
            client,
            url: format!(
                "{}/2010-04-01/Accounts/{account_sid}/Messages.json",
                api_base.trim_end_matches('/')
            ),
            auth: STANDARD.encode(format!("{account_sid}:{auth_token}")),
            from: from.to_string(),
            to,
        }
    }

    async fn send_one(&self, to: &str, body: &str) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Basic {}", self.auth))
            .form(&[("To", to), ("From", self.from.as_str()), ("Body", body)])
            .send()
            .await?;
        check(resp).await
    }

    fn from_config(client: &Client, config: &SmsConfig) -> Option<Self> {
        if config.to.is_empty() {
            return None;
        }
        Some(Self::new(
            client.clone(),
            config.api_base.as_deref().unwrap_or(TWILIO_API),
            config.account_sid.as_deref()?,
            config.auth_token.as_deref()?,
            config.from.as_deref()?,
            config.to.clone(),
        ))
    }
}

#[async_trait]
impl Channel for SmsChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    /// Recipients are sent in order. A failure after the first success is
    /// reported as `Partial` so the dispatcher does not resend to everyone.
    async fn send(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
        for (delivered, to) in self.to.iter().enumerate() {
            if let Err(e) = self.send_one(to, &event.message).await {
                if delivered == 0 {
                    return Err(e);
                }
                return Err(DeliveryError::Partial {
                    delivered,
                    total: self.to.len(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Local desktop notification.
pub struct DesktopChannel;

#[async_trait]
impl Channel for DesktopChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Desktop
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
        let title = format!("txguard: {} ({})", event.rule, event.branch);
        let body = event.message.clone();
        // notify-rust blocks on the notification daemon
        tokio::task::spawn_blocking(move || {
            notify_rust::Notification::new()
                .summary(&title)
                .body(&body)
                .show()
                .map(|_| ())
                .map_err(|e| DeliveryError::Transport(e.to_string()))
        })
        .await
        .map_err(|e| DeliveryError::Transport(e.to_string()))?
    }
}

/// Writes alerts to the tracing log. Always succeeds.
pub struct LogChannel;

#[async_trait]
impl Channel for LogChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Log
    }

    async fn send(&self, event: &AlertEvent) -> Result<(), DeliveryError> {
        match event.severity {
            Severity::Critical => tracing::error!(branch = %event.branch, rule = %event.rule, "{}", event.message),
            Severity::Warning => tracing::warn!(branch = %event.branch, rule = %event.rule, "{}", event.message),
            Severity::Info => tracing::info!(branch = %event.branch, rule = %event.rule, "{}", event.message),
        }
        Ok(())
    }
}

/// Instantiate every enabled channel that has its credentials.
pub fn build_channels(config: &ChannelsConfig) -> Vec<Arc<dyn Channel>> {
    let client = Client::new();
    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();

    if config.telegram.enabled {
        match TelegramChannel::from_config(&client, &config.telegram) {
            Some(c) => channels.push(Arc::new(c)),
            None => tracing::warn!("Telegram enabled but bot_token or chat_id missing"),
        }
    }
    if config.slack.enabled {
        match SlackChannel::from_config(&client, &config.slack) {
            Some(c) => channels.push(Arc::new(c)),
            None => tracing::warn!("Slack enabled but webhook_url missing"),
        }
    }
    if config.sms.enabled {
        match SmsChannel::from_config(&client, &config.sms) {
            Some(c) => channels.push(Arc::new(c)),
            None => tracing::warn!("SMS enabled but Twilio credentials or recipients missing"),
        }
    }
    if config.desktop.enabled {
        channels.push(Arc::new(DesktopChannel));
    }
    if config.log.enabled {
        channels.push(Arc::new(LogChannel));
    }

    let kinds: Vec<_> = channels.iter().map(|c| c.kind().as_str()).collect();
    tracing::info!("Alert channels: {}", kinds.join(", "));
    channels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::at;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Read one request: headers, then `content-length` bytes of body.
    async fn read_request(sock: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = sock.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + len {
                    return;
                }
            }
        }
    }

    /// Local HTTP endpoint answering the n-th request with `statuses[n]`, the
    /// last status repeating. Returns its base URL and a request counter.
    async fn provider(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                read_request(&mut sock).await;
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let status = statuses[n.min(statuses.len() - 1)];
                let resp = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}"
                );
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    fn sms(base: &str) -> SmsChannel {
        SmsChannel::new(
            Client::new(),
            base,
            "AC1",
            "secret",
            "+100",
            vec!["+200".into(), "+300".into(), "+400".into()],
        )
    }

    fn event(severity: Severity) -> AlertEvent {
        AlertEvent {
            id: "e1".into(),
            branch: "North".into(),
            rule: "risk-critical".into(),
            severity,
            message: "🚨 CRITICAL: [North] test".into(),
            metrics: serde_json::Value::Null,
            channels: vec![],
            created_at: at(2025, 1, 1, 10, 0),
        }
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_error(401, String::new()), DeliveryError::Auth(401));
        assert_eq!(status_error(403, String::new()), DeliveryError::Auth(403));
        assert_eq!(status_error(429, String::new()), DeliveryError::RateLimited);
        assert_eq!(
            status_error(502, "bad gateway".into()),
            DeliveryError::Http {
                status: 502,
                body: "bad gateway".into()
            }
        );
    }

    #[test]
    fn slack_colors_by_severity() {
        let critical = SlackChannel::payload(&event(Severity::Critical));
        assert_eq!(critical["attachments"][0]["color"], "#ff0000");
        let info = SlackChannel::payload(&event(Severity::Info));
        assert_eq!(info["attachments"][0]["color"], "#36a64f");
        assert_eq!(info["text"], "🚨 CRITICAL: [North] test");
    }

    #[test]
    fn telegram_url() {
        let c = TelegramChannel::new(Client::new(), "https://api.telegram.org/", "123:abc", "42");
        assert_eq!(c.url, "https://api.telegram.org/bot123:abc/sendMessage");
    }

    #[test]
    fn sms_basic_auth() {
        let c = SmsChannel::new(Client::new(), TWILIO_API, "AC1", "secret", "+100", vec!["+200".into()]);
        assert_eq!(c.url, "https://api.twilio.com/2010-04-01/Accounts/AC1/Messages.json");
        // base64("AC1:secret")
        assert_eq!(c.auth, "QUMxOnNlY3JldA==");
    }

    #[test]
    fn build_skips_unconfigured() {
        let mut config = ChannelsConfig::default();
        config.telegram.enabled = true;
        config.slack.enabled = true;
        config.slack.webhook_url = Some("http://localhost/hook".into());
        let kinds: Vec<_> = build_channels(&config).iter().map(|c| c.kind()).collect();
        assert_eq!(kinds, vec![ChannelKind::Slack, ChannelKind::Log]);
    }

    #[tokio::test]
    async fn sms_failure_after_first_recipient_is_partial() {
        let (base, hits) = provider(vec![201, 500]).await;
        let err = sms(&base).send(&event(Severity::Critical)).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Partial {
                delivered: 1,
                total: 3,
                ..
            }
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sms_failure_on_first_recipient_keeps_its_cause() {
        let (base, _) = provider(vec![500]).await;
        let err = sms(&base).send(&event(Severity::Critical)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Http { status: 500, .. }));

        let (base, hits) = provider(vec![201]).await;
        assert!(sms(&base).send(&event(Severity::Critical)).await.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_timeout_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    drop(sock);
                });
            }
        });
        let client = Client::builder()
            .timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let channel = TelegramChannel::new(client, &format!("http://{addr}"), "123:abc", "42");
        let err = channel.send(&event(Severity::Info)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)), "{err}");
        assert!(!err.to_string().contains("after 0 ms"));
    }

    #[tokio::test]
    async fn log_channel_always_delivers() {
        assert!(LogChannel.send(&event(Severity::Warning)).await.is_ok());
    }
}
