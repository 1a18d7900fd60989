use chrono::{Datelike, Utc};
use minijinja::{context, Environment};

const BRAND: &str = "HeyHey";

const ASSISTANT_PROMPT_TEMPLATE: &str = include_str!("prompts/assistant_prompt.j2");
const EMAIL_LAYOUT_TEMPLATE: &str = include_str!("prompts/email_layout.html.j2");
const PASSWORD_RESET_TEMPLATE: &str = include_str!("prompts/password_reset.html.j2");
const WELCOME_TEMPLATE: &str = include_str!("prompts/welcome.html.j2");

/// System prompt for flow AI nodes whose content is blank.
pub const DEFAULT_ASSISTANT_PROMPT: &str = "Eres un asistente virtual amable y profesional.";

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    for (name, source) in [
        ("assistant_prompt", ASSISTANT_PROMPT_TEMPLATE),
        ("email_layout.html", EMAIL_LAYOUT_TEMPLATE),
        ("password_reset.html", PASSWORD_RESET_TEMPLATE),
        ("welcome.html", WELCOME_TEMPLATE),
    ] {
        if let Err(err) = env.add_template(name, source) {
            tracing::warn!(template = name, error = %err, "template failed to parse");
        }
    }
    env
}

fn render(name: &str, ctx: minijinja::Value) -> Option<String> {
    let env = environment();
    let template = env.get_template(name).ok()?;
    match template.render(ctx) {
        Ok(rendered) => Some(rendered),
        Err(err) => {
            tracing::warn!(template = name, error = %err, "template failed to render");
            None
        }
    }
}

/// System prompt for the AI playground. A non-blank custom prompt replaces
/// the built-in assistant persona entirely.
pub fn playground_system_prompt(custom_prompt: Option<&str>) -> String {
    if let Some(custom) = custom_prompt.map(str::trim).filter(|p| !p.is_empty()) {
        return custom.to_string();
    }
    render("assistant_prompt", context! { brand => BRAND })
        .unwrap_or_else(fallback_assistant_prompt)
}

fn fallback_assistant_prompt() -> String {
    format!(
        "Eres un asistente virtual de {BRAND}, una plataforma de WhatsApp Business.\n\
         Responde de forma concisa y útil en el mismo idioma en que te escriben."
    )
}

pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

pub fn password_reset_email(reset_url: &str) -> RenderedEmail {
    let html = render(
        "password_reset.html",
        context! { brand => BRAND, year => Utc::now().year(), reset_url => reset_url },
    )
    .unwrap_or_else(|| {
        format!("<p>Restablece tu contraseña: <a href=\"{reset_url}\">{reset_url}</a></p>")
    });
    RenderedEmail {
        subject: format!("Recuperar contraseña - {BRAND}"),
        html,
    }
}

pub fn welcome_email(name: &str) -> RenderedEmail {
    let html = render(
        "welcome.html",
        context! { brand => BRAND, year => Utc::now().year(), name => name },
    )
    .unwrap_or_else(|| format!("<p>Gracias por registrarte en {BRAND}.</p>"));
    RenderedEmail {
        subject: format!("Bienvenido a {BRAND}"),
        html,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_playground_prompt_mentions_brand() {
        let prompt = playground_system_prompt(None);
        assert!(prompt.starts_with("Eres un asistente virtual de HeyHey"));
        assert!(prompt.contains("mismo idioma"));
    }

    #[test]
    fn custom_prompt_replaces_default() {
        assert_eq!(playground_system_prompt(Some("  Be terse. ")), "Be terse.");
        assert!(playground_system_prompt(Some("   ")).contains("HeyHey"));
    }

    #[test]
    fn reset_email_embeds_link() {
        let email = password_reset_email("http://localhost:3000/reset-password?token=abc");
        assert_eq!(email.subject, "Recuperar contraseña - HeyHey");
        assert!(email.html.contains("href=\"http://localhost:3000/reset-password?token=abc\""));
        assert!(email.html.contains("expirará en 1 hora"));
        assert!(email.html.contains(&Utc::now().year().to_string()));
    }

    #[test]
    fn welcome_email_escapes_name() {
        let email = welcome_email("<b>Ana</b>");
        assert!(email.html.contains("&lt;b&gt;Ana"));
        assert!(!email.html.contains("<b>Ana</b>"));
    }
}
