use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::debug;

use parley_gateway::Hub;
use parley_types::events::{USER_CREATED, WS_SEND_PAYLOAD};

use crate::bus::{EventBus, EventContext, EventHandler, EventPayload};
use crate::mail::{MailSender, OutgoingMail};

/// Mails the activation link to a freshly registered user.
pub struct VerificationEmailHandler {
    mailer: Arc<dyn MailSender>,
}

impl VerificationEmailHandler {
    pub fn new(mailer: Arc<dyn MailSender>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl EventHandler for VerificationEmailHandler {
    fn name(&self) -> &'static str {
        "verification_email"
    }

    async fn handle(&self, ctx: EventContext, payload: EventPayload) -> Result<()> {
        let EventPayload::UserCreated(user) = payload else {
            bail!("expected a new user payload");
        };

        let mail = OutgoingMail {
            to: user.email.clone(),
            subject: "Verify your Parley account".into(),
            html_body: format!(
                "<p>Hi {},</p><p>Confirm your account by opening \
                 <a href=\"{link}\">{link}</a>. The link expires in 15 minutes.</p>",
                user.username,
                link = user.activation_link,
            ),
        };

        tokio::time::timeout(ctx.io_timeout, self.mailer.send(mail))
            .await
            .with_context(|| format!("verification mail to {} timed out", user.email))?
    }
}

/// Serializes a frame and pushes it into the addressed room, if live.
pub struct WsDeliveryHandler {
    hub: Hub,
}

impl WsDeliveryHandler {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl EventHandler for WsDeliveryHandler {
    fn name(&self) -> &'static str {
        "ws_delivery"
    }

    async fn handle(&self, _ctx: EventContext, payload: EventPayload) -> Result<()> {
        let EventPayload::SendPayload(delivery) = payload else {
            bail!("expected a websocket delivery payload");
        };

        let json = delivery.event.to_json()?;
        debug!("Delivering {:?} to {}", delivery.event.detail, delivery.receiver);
        self.hub.send_payload_to(&delivery.receiver, Arc::from(json)).await;
        Ok(())
    }
}

/// Wire the built-in subscriptions.
pub fn register_default_handlers(bus: &EventBus, hub: Hub, mailer: Arc<dyn MailSender>) {
    bus.subscribe(USER_CREATED, Arc::new(VerificationEmailHandler::new(mailer)));
    bus.subscribe(WS_SEND_PAYLOAD, Arc::new(WsDeliveryHandler::new(hub)));
}
