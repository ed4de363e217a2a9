use anyhow::Context;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use uuid::Uuid;

use crate::config::Config;
use crate::services::billing::format_cents;

pub struct EmailService {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailService {
    /// Returns None if SMTP is not fully configured.
    pub fn new(config: &Config) -> Option<Self> {
        let host = config.smtp_host.as_deref()?;
        let username = config.smtp_username.clone()?;
        let password = config.smtp_password.clone()?;
        let from_addr = config.smtp_from.as_deref()?;

        let port = config.smtp_port.unwrap_or(587);
        let creds = Credentials::new(username, password);

        let transport = if port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .ok()?
                .credentials(creds)
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .ok()?
                .credentials(creds)
                .build()
        };

        let from: Mailbox = from_addr.parse().ok()?;

        Some(Self { transport, from })
    }

    fn new_message_id(&self) -> String {
        format!("<{}@{}>", Uuid::new_v4(), self.from.email.domain())
    }

    /// Wraps inner HTML content in a consistent school-branded layout.
    fn wrap_html(school_name: &str, content: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width,initial-scale=1">
  <title>{school_name}</title>
</head>
<body style="margin:0;padding:0;background-color:#f1f5f9;font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,Helvetica,Arial,sans-serif">
  <table role="presentation" width="100%" cellpadding="0" cellspacing="0" style="background-color:#f1f5f9;padding:40px 16px">
    <tr>
      <td align="center">
        <table role="presentation" width="100%" cellpadding="0" cellspacing="0" style="max-width:520px">
          <tr>
            <td align="center" style="padding-bottom:28px">
              <p style="margin:0;font-size:20px;font-weight:700;color:#0f172a;text-align:center">{school_name}</p>
            </td>
          </tr>
          <tr>
            <td style="background:#ffffff;border-radius:12px;padding:40px;box-shadow:0 1px 3px rgba(0,0,0,0.08)">
              {content}
            </td>
          </tr>
          <tr>
            <td align="center" style="padding-top:20px">
              <p style="margin:0;font-size:12px;color:#94a3b8">{school_name}</p>
            </td>
          </tr>
        </table>
      </td>
    </tr>
  </table>
</body>
</html>"#
        )
    }

    async fn send_email(
        &self,
        to: Mailbox,
        subject: &str,
        text: &str,
        html: &str,
    ) -> anyhow::Result<()> {
        let email = Message::builder()
            .message_id(Some(self.new_message_id()))
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text.to_string()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.to_string()),
                    ),
            )
            .context("Failed to build email message")?;

        self.transport
            .send(email)
            .await
            .context("Failed to send email")?;

        Ok(())
    }

    pub async fn send_payment_receipt(
        &self,
        to_email: &str,
        to_name: &str,
        school_name: &str,
        description: &str,
        amount_cents: i64,
    ) -> anyhow::Result<()> {
        let to: Mailbox = format!("{to_name} <{to_email}>")
            .parse()
            .or_else(|_| to_email.parse())
            .context("Invalid recipient address")?;

        let amount = format_cents(amount_cents);
        let text = format!(
            "Hi {to_name},\n\nYour payment of {amount} for \"{description}\" was received by {school_name}.\n\nThank you!"
        );
        let html = Self::wrap_html(
            school_name,
            &format!(
                r#"<p style="margin:0 0 16px;font-size:16px;color:#0f172a">Hi {to_name},</p>
<p style="margin:0 0 16px;font-size:15px;color:#334155">Your payment of <strong>{amount}</strong> for &ldquo;{description}&rdquo; was received.</p>
<p style="margin:0;font-size:15px;color:#334155">Thank you!</p>"#
            ),
        );

        self.send_email(to, &format!("Payment received — {school_name}"), &text, &html)
            .await
    }

    pub async fn send_payment_failed(
        &self,
        to_email: &str,
        to_name: &str,
        school_name: &str,
        description: &str,
    ) -> anyhow::Result<()> {
        let to: Mailbox = format!("{to_name} <{to_email}>")
            .parse()
            .or_else(|_| to_email.parse())
            .context("Invalid recipient address")?;

        let text = format!(
            "Hi {to_name},\n\nYour payment for \"{description}\" could not be processed. Please update your payment method and try again."
        );
        let html = Self::wrap_html(
            school_name,
            &format!(
                r#"<p style="margin:0 0 16px;font-size:16px;color:#0f172a">Hi {to_name},</p>
<p style="margin:0 0 16px;font-size:15px;color:#334155">Your payment for &ldquo;{description}&rdquo; could not be processed.</p>
<p style="margin:0;font-size:15px;color:#334155">Please update your payment method and try again.</p>"#
            ),
        );

        self.send_email(to, &format!("Payment failed — {school_name}"), &text, &html)
            .await
    }
}
