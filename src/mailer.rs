use lettre::{
    message::{header::ContentType, Message},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};

use crate::{config::Config, prompting::RenderedEmail};

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build email: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Whether an email was handed to SMTP or only logged because SMTP is not
/// configured.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Logged,
}

pub async fn send_email(config: &Config, to: &str, email: &RenderedEmail) -> Result<Delivery, MailError> {
    let Some(smtp) = &config.smtp else {
        tracing::info!(to, subject = %email.subject, "smtp not configured, email not sent");
        return Ok(Delivery::Logged);
    };

    let message = Message::builder()
        .from(smtp.from.parse()?)
        .to(to.parse()?)
        .subject(email.subject.clone())
        .header(ContentType::TEXT_HTML)
        .body(email.html.clone())?;

    let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)?
        .port(smtp.port)
        .credentials(Credentials::new(smtp.user.clone(), smtp.password.clone()))
        .build();

    transport.send(message).await?;
    tracing::info!(to, subject = %email.subject, "email sent");
    Ok(Delivery::Sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompting::password_reset_email;

    #[tokio::test]
    async fn logs_instead_of_sending_without_smtp() {
        let config = Config::for_tests();
        let email = password_reset_email("http://localhost:3000/reset-password?token=t");
        let delivery = send_email(&config, "ana@example.com", &email).await.unwrap();
        assert_eq!(delivery, Delivery::Logged);
    }

    #[tokio::test]
    async fn rejects_bad_recipient_when_smtp_is_set() {
        let mut config = Config::for_tests();
        config.smtp = Some(crate::config::SmtpConfig {
            host: "127.0.0.1".to_string(),
            port: 9,
            user: "u".to_string(),
            password: "p".to_string(),
            from: "HeyHey <noreply@heyhey.com>".to_string(),
        });
        let email = password_reset_email("http://x");
        let err = send_email(&config, "not an address", &email).await.unwrap_err();
        assert!(matches!(err, MailError::Address(_)));
    }
}
