use serde::Serialize;
use url::form_urlencoded;

use crate::services::templates::escape_html;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locale {
    Es,
    En,
    Fr,
    De,
    It,
}

impl Locale {
    /// `es`, `es-ES`, `ES_es` ... ; anything unknown falls back to English.
    pub fn parse(raw: Option<&str>) -> Self {
        let primary = raw
            .unwrap_or_default()
            .trim()
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match primary.as_str() {
            "es" => Self::Es,
            "fr" => Self::Fr,
            "de" => Self::De,
            "it" => Self::It,
            _ => Self::En,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Es => "es",
            Self::En => "en",
            Self::Fr => "fr",
            Self::De => "de",
            Self::It => "it",
        }
    }
}

pub fn review_message(locale: Locale, first_name: &str, org_name: &str, review_url: &str) -> String {
    let name = first_name.trim();
    match locale {
        Locale::Es => format!(
            "¡Hola {name}! Gracias por alquilar con {org_name}. ¿Nos dejas tu opinión? {review_url}"
        ),
        Locale::En => format!(
            "Hi {name}! Thanks for renting with {org_name}. Would you leave us a review? {review_url}"
        ),
        Locale::Fr => format!(
            "Bonjour {name} ! Merci d'avoir loué avec {org_name}. Pouvez-vous nous laisser un avis ? {review_url}"
        ),
        Locale::De => format!(
            "Hallo {name}! Danke, dass Sie bei {org_name} gemietet haben. Hinterlassen Sie uns eine Bewertung? {review_url}"
        ),
        Locale::It => format!(
            "Ciao {name}! Grazie per aver noleggiato con {org_name}. Ci lasci una recensione? {review_url}"
        ),
    }
}

pub fn review_subject(locale: Locale, org_name: &str) -> String {
    match locale {
        Locale::Es => format!("¿Qué tal tu alquiler con {org_name}?"),
        Locale::En => format!("How was your rental with {org_name}?"),
        Locale::Fr => format!("Comment s'est passée votre location avec {org_name} ?"),
        Locale::De => format!("Wie war Ihre Miete bei {org_name}?"),
        Locale::It => format!("Com'è andato il noleggio con {org_name}?"),
    }
}

/// Digits only, with a leading `+` or `00` international prefix removed.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let without_plus = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let digits = without_plus
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>();
    let digits = if trimmed.starts_with('+') {
        digits
    } else {
        digits.strip_prefix("00").map(ToOwned::to_owned).unwrap_or(digits)
    };
    (digits.len() >= 6).then_some(digits)
}

pub fn whatsapp_link(phone: &str, text: &str) -> Option<String> {
    let digits = normalize_phone(phone)?;
    let encoded = form_urlencoded::byte_serialize(text.as_bytes())
        .collect::<String>()
        .replace('+', "%20");
    Some(format!("https://wa.me/{digits}?text={encoded}"))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewRequest {
    pub locale: &'static str,
    pub message: String,
    pub whatsapp_link: Option<String>,
    pub email_subject: String,
    pub email_html: String,
    pub email_to: Option<String>,
}

pub struct ReviewRecipient<'a> {
    pub first_name: &'a str,
    pub phone: Option<&'a str>,
    pub email: Option<&'a str>,
    pub language: Option<&'a str>,
}

pub fn compose_review_request(
    recipient: &ReviewRecipient<'_>,
    org_name: &str,
    review_url: &str,
) -> ReviewRequest {
    let locale = Locale::parse(recipient.language);
    let message = review_message(locale, recipient.first_name, org_name, review_url);
    let email_html = format!(
        "<p>{}</p><p><a href=\"{}\">{}</a></p>",
        escape_html(&review_message(locale, recipient.first_name, org_name, "")),
        escape_html(review_url),
        escape_html(review_url)
    );
    ReviewRequest {
        locale: locale.code(),
        whatsapp_link: recipient.phone.and_then(|phone| whatsapp_link(phone, &message)),
        email_subject: review_subject(locale, org_name),
        email_to: recipient
            .email
            .map(str::trim)
            .filter(|email| email.contains('@'))
            .map(ToOwned::to_owned),
        email_html,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::{compose_review_request, normalize_phone, whatsapp_link, Locale, ReviewRecipient};

    #[test]
    fn locale_fallback_is_english() {
        assert_eq!(Locale::parse(Some("es-ES")), Locale::Es);
        assert_eq!(Locale::parse(Some("DE")), Locale::De);
        assert_eq!(Locale::parse(Some("pt")), Locale::En);
        assert_eq!(Locale::parse(None), Locale::En);
    }

    #[test]
    fn phones_are_reduced_to_digits() {
        assert_eq!(normalize_phone("+34 600 11 22 33").as_deref(), Some("34600112233"));
        assert_eq!(normalize_phone("0034600112233").as_deref(), Some("34600112233"));
        assert_eq!(normalize_phone("abc"), None);
    }

    #[test]
    fn whatsapp_links_encode_text() {
        let link = whatsapp_link("+34600112233", "¡Hola Ana! a&b").expect("link");
        assert!(link.starts_with("https://wa.me/34600112233?text="));
        assert!(link.contains("%C2%A1Hola%20Ana%21%20a%26b"));
    }

    #[test]
    fn composes_localized_request() {
        let request = compose_review_request(
            &ReviewRecipient {
                first_name: "Lucía",
                phone: Some("+34600112233"),
                email: Some("lucia@example.com"),
                language: Some("es"),
            },
            "Motos Sol",
            "https://g.page/r/motos-sol",
        );
        assert_eq!(request.locale, "es");
        assert!(request.message.starts_with("¡Hola Lucía!"));
        assert!(request.whatsapp_link.is_some());
        assert_eq!(request.email_to.as_deref(), Some("lucia@example.com"));
    }
}
