use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<()>;
}

/// Sends over an authenticated SMTP relay.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(host: &str, user: &str, password: &str) -> Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .with_context(|| format!("invalid SMTP relay {}", host))?
            .credentials(Credentials::new(user.to_string(), password.to_string()))
            .build();
        let from: Mailbox = format!("Parley <{}>", user)
            .parse()
            .with_context(|| format!("invalid sender address {}", user))?;
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl MailSender for SmtpMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<()> {
        let to: Mailbox = mail.to.parse().context("invalid recipient address")?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(mail.subject)
            .header(ContentType::TEXT_HTML)
            .body(mail.html_body)?;
        self.transport.send(message).await?;
        info!("Mail sent to {}", mail.to);
        Ok(())
    }
}

/// Stand-in used when no SMTP relay is configured. The body carries the
/// activation token, so it only shows up at debug level.
pub struct LogMailer;

#[async_trait]
impl MailSender for LogMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<()> {
        info!("(mail not sent) to={} subject={:?}", mail.to, mail.subject);
        debug!("Unsent mail body for {}:\n{}", mail.to, mail.html_body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn unsent_body_stays_out_of_info_logs() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(captured.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mail = OutgoingMail {
            to: "alice@parley.test".into(),
            subject: "Activate your account".into(),
            html_body: r#"<a href="http://parley.test/auth/verify/s3cr3t-token">activate</a>"#.into(),
        };
        LogMailer.send(mail).await.unwrap();

        let logged = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("alice@parley.test"), "{}", logged);
        assert!(!logged.contains("s3cr3t-token"), "{}", logged);
    }
}
