use std::collections::HashMap;

use thiserror::Error;

string_enum! {
    /// Transactional emails sent by the platform.
    pub enum MailTemplate {
        Welcome => "welcome",
        ApplicationReceived => "application_received",
        ApplicationStatusChanged => "application_status_changed",
        PasswordReset => "password_reset",
    }
}

impl MailTemplate {
    fn source(self) -> (&'static str, &'static str) {
        match self {
            Self::Welcome => (
                "Welcome to Job Board, {{name}}",
                "Hi {{name}},\n\nYour {{role}} account is ready. Sign in at {{link}}.\n",
            ),
            Self::ApplicationReceived => (
                "We received your application for {{job_title}}",
                "Hi {{name}},\n\nThanks for applying to {{job_title}} at {{company}}. \
                 We will let you know when the employer reviews it.\n",
            ),
            Self::ApplicationStatusChanged => (
                "Your application for {{job_title}} is now {{status}}",
                "Hi {{name}},\n\nThe status of your application to {{job_title}} \
                 changed to {{status}}.\n{{note}}\n",
            ),
            Self::PasswordReset => (
                "Reset your Job Board password",
                "Hi {{name}},\n\nUse this link to choose a new password: {{link}}\n\
                 The link expires in {{minutes}} minutes.\n",
            ),
        }
    }

    /// Renders subject and body with every `{{key}}` replaced.
    pub fn render(self, vars: &HashMap<&str, String>) -> Result<RenderedMail, TemplateError> {
        let (subject, body) = self.source();
        Ok(RenderedMail {
            subject: render(subject, vars)?,
            body: render(body, vars)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMail {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template variable `{0}` was not provided")]
    MissingVariable(String),
    #[error("unterminated placeholder in template")]
    Unterminated,
}

/// Substitutes `{{key}}` markers in `source` using `vars`.
pub fn render(source: &str, vars: &HashMap<&str, String>) -> Result<String, TemplateError> {
    let mut output = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(TemplateError::Unterminated)?;
        let key = after[..end].trim();
        let value = vars
            .get(key)
            .ok_or_else(|| TemplateError::MissingVariable(key.to_string()))?;
        output.push_str(value);
        rest = &after[end + 2..];
    }
    output.push_str(rest);

    Ok(output)
}
