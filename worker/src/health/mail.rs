//! SMTP reachability probe.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::{debug, warn};

use super::{HealthProbe, HealthReport};
use crate::config::{MailConfig, MailTls};

#[derive(Debug, Error)]
enum ProbeError {
    #[error("invalid probe address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("failed to build test message: {0}")]
    Message(#[from] lettre::error::Error),

    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Sends a self-addressed test message over a fresh SMTP connection.
///
/// The whole exchange is bounded by [`MailConfig::timeout`], so the probe
/// never hangs on a silent or unroutable host.
pub struct MailProbe {
    config: MailConfig,
}

impl MailProbe {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }

    async fn send_test_message(&self) -> Result<(), ProbeError> {
        let mailbox: Mailbox = self.config.probe_address.parse()?;
        let message = Message::builder()
            .from(mailbox.clone())
            .to(mailbox)
            .subject("Health check")
            .body(String::from("SMTP health check"))?;

        let host = self.config.host.as_str();
        let builder = match self.config.tls {
            MailTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
            MailTls::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?,
            MailTls::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host)?,
        };
        let mut builder = builder
            .port(self.config.port)
            .timeout(Some(self.config.timeout));
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        let transport: AsyncSmtpTransport<Tokio1Executor> = builder.build();

        transport.send(message).await?;
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for MailProbe {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn check(&self) -> HealthReport {
        let timeout = self.config.timeout;
        let result = match tokio::time::timeout(timeout, self.send_test_message()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(timeout)),
        };

        match result {
            Ok(()) => {
                debug!(host = %self.config.host, port = self.config.port, "smtp_probe_ok");
                HealthReport::healthy("SMTP server accepted the test message")
            }
            Err(e) => {
                warn!(
                    host = %self.config.host,
                    port = self.config.port,
                    error = %e,
                    "smtp_probe_failed"
                );
                HealthReport::unhealthy("SMTP server is unreachable", Some(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthStatus;
    use std::time::Instant;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn config(port: u16, timeout: Duration) -> MailConfig {
        MailConfig {
            host: "127.0.0.1".to_string(),
            port,
            tls: MailTls::None,
            username: None,
            password: None,
            probe_address: "healthcheck@localhost".to_string(),
            timeout,
        }
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // Accepts connections but never sends the SMTP greeting.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let probe = MailProbe::new(config(port, Duration::from_millis(300)));
        let started = Instant::now();
        let report = probe.check().await;

        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = MailProbe::new(config(port, Duration::from_secs(2)));
        let report = probe.check().await;

        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn test_invalid_probe_address_is_unhealthy() {
        let mut config = config(25, Duration::from_secs(1));
        config.probe_address = "not an address".to_string();

        let report = MailProbe::new(config).check().await;

        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.error.unwrap().contains("invalid probe address"));
    }

    #[tokio::test]
    async fn test_starttls_required_but_not_offered_is_unhealthy() {
        // Greets and answers EHLO without advertising STARTTLS.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let _ = write.write_all(b"220 localhost ESMTP\r\n").await;
            while let Ok(Some(line)) = lines.next_line().await {
                let reply: &[u8] = if line.to_ascii_uppercase().starts_with("EHLO") {
                    b"250 localhost\r\n"
                } else {
                    b"221 bye\r\n"
                };
                if write.write_all(reply).await.is_err() {
                    break;
                }
            }
        });

        let mut config = config(port, Duration::from_secs(2));
        config.tls = MailTls::StartTls;
        config.username = Some("svc@example.com".to_string());
        config.password = Some("secret".to_string());
        let started = Instant::now();
        let report = MailProbe::new(config).check().await;

        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.error.is_some());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_implicit_tls_against_refused_port_is_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = config(port, Duration::from_secs(2));
        config.tls = MailTls::Tls;
        let report = MailProbe::new(config).check().await;

        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.error.is_some());
    }
}
