pub mod bus;
pub mod handlers;
pub mod mail;

pub use bus::{EventBus, EventContext, EventHandler, EventPayload};
pub use handlers::register_default_handlers;
pub use mail::{LogMailer, MailSender, OutgoingMail, SmtpMailer};
