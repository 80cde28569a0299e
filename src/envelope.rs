use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

/// Content type attached to every published envelope.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Campaign label used when none is given.
pub const DEFAULT_CAMPAIGN: &str = "default";

/// Notification envelope carried through the broker.
///
/// An `Envelope` bundles the tracing metadata every message shares (`id`,
/// `created_at`, `campaign`) with a kind-specific [`Notification`] payload.
/// It is immutable once built: fields are private and only readable through
/// accessors.
///
/// ## Wire format
///
/// Envelopes travel as UTF-8 JSON with stable field names:
///
/// ```json
/// {
///   "id": "6f1c…",
///   "createdAt": "2024-05-01T10:00:00Z",
///   "campaign": "spring-sale",
///   "kind": "SMS",
///   "payload": { "phone": "+15550100", "text": "hi" }
/// }
/// ```
///
/// ## Example
///
/// ```rust
/// use mailbag::Envelope;
///
/// let envelope = Envelope::sms("+15550100", "hi").with_campaign("spring-sale");
/// let bytes = envelope.encode().unwrap();
/// let decoded = Envelope::decode(&bytes, Some("application/json")).unwrap();
///
/// assert_eq!(envelope, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    id: String,
    created_at: DateTime<Utc>,
    #[serde(default = "default_campaign")]
    campaign: String,
    #[serde(flatten)]
    notification: Notification,
}

fn default_campaign() -> String {
    DEFAULT_CAMPAIGN.to_owned()
}

impl Envelope {
    /// Create an envelope with a fresh id, the current time and the default
    /// campaign.
    pub fn new(notification: impl Into<Notification>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            campaign: default_campaign(),
            notification: notification.into(),
        }
    }

    /// Shorthand for an SMS envelope.
    pub fn sms(phone: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(SmsPayload {
            phone: phone.into(),
            text: text.into(),
        })
    }

    /// Shorthand for an email envelope.
    pub fn email(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(EmailPayload {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
        })
    }

    /// Set the campaign label.
    pub fn with_campaign(mut self, campaign: impl Into<String>) -> Self {
        self.campaign = campaign.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn campaign(&self) -> &str {
        &self.campaign
    }

    pub fn kind(&self) -> Kind {
        self.notification.kind()
    }

    pub fn notification(&self) -> &Notification {
        &self.notification
    }

    /// Serialize the envelope into its JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode an envelope from a delivery body.
    ///
    /// `content_type` is the content type the delivery carried, if any. A
    /// missing content type is decoded as JSON; any other type than
    /// [`CONTENT_TYPE_JSON`] is refused.
    pub fn decode(body: &[u8], content_type: Option<&str>) -> Result<Self, DecodeError> {
        if let Some(content_type) = content_type {
            let mime = content_type.split(';').next().unwrap_or_default().trim();
            if !mime.eq_ignore_ascii_case(CONTENT_TYPE_JSON) {
                return Err(DecodeError::new(DecodeErrorKind::UnsupportedContentType(
                    content_type.to_owned(),
                )));
            }
        }

        let text = std::str::from_utf8(body)
            .map_err(|e| DecodeError::new(DecodeErrorKind::InvalidUtf8(e)))?;

        serde_json::from_str(text).map_err(|e| DecodeError::new(DecodeErrorKind::Json(e)))
    }
}

/// Kind-specific notification payload, keyed by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Notification {
    #[serde(rename = "SMS")]
    Sms(SmsPayload),
    #[serde(rename = "EMAIL")]
    Email(EmailPayload),
}

impl Notification {
    pub fn kind(&self) -> Kind {
        match self {
            Notification::Sms(_) => Kind::Sms,
            Notification::Email(_) => Kind::Email,
        }
    }
}

impl From<SmsPayload> for Notification {
    fn from(value: SmsPayload) -> Self {
        Notification::Sms(value)
    }
}

impl From<EmailPayload> for Notification {
    fn from(value: EmailPayload) -> Self {
        Notification::Email(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsPayload {
    pub phone: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Notification discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    #[serde(rename = "SMS")]
    Sms,
    #[serde(rename = "EMAIL")]
    Email,
}

impl Kind {
    /// Tag used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Sms => "SMS",
            Kind::Email => "EMAIL",
        }
    }

    /// Conventional routing key for this kind.
    pub fn routing_key(&self) -> &'static str {
        match self {
            Kind::Sms => "sms",
            Kind::Email => "email",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a delivery body cannot be turned into an [`Envelope`].
///
/// A decode failure is permanent for that message: it is a poison message and
/// must never be requeued.
#[derive(Debug)]
pub struct DecodeError {
    context: SpanTrace,
    kind: DecodeErrorKind,
}

/// Decode errors kind.
#[derive(Debug)]
pub enum DecodeErrorKind {
    /// The delivery declared a content type other than JSON.
    UnsupportedContentType(String),
    /// The body is not valid UTF-8.
    InvalidUtf8(std::str::Utf8Error),
    /// The body is not a valid envelope (malformed, unknown kind, missing field).
    Json(serde_json::Error),
}

impl DecodeError {
    fn new(kind: DecodeErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &DecodeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DecodeErrorKind::UnsupportedContentType(ct) => {
                writeln!(f, "Unsupported content type: {ct}")
            }
            DecodeErrorKind::InvalidUtf8(err) => writeln!(f, "Invalid UTF-8 body: {err}"),
            DecodeErrorKind::Json(err) => writeln!(f, "Invalid envelope: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DecodeErrorKind::UnsupportedContentType(_) => None,
            DecodeErrorKind::InvalidUtf8(err) => Some(err),
            DecodeErrorKind::Json(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_stable_field_names() {
        let envelope = Envelope::sms("+1", "hi").with_campaign("t");
        let value: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();

        assert_eq!(value["id"], envelope.id());
        assert_eq!(value["campaign"], "t");
        assert_eq!(value["kind"], "SMS");
        assert_eq!(value["payload"]["phone"], "+1");
        assert_eq!(value["payload"]["text"], "hi");
        assert!(value["createdAt"].is_string());
    }

    #[test]
    fn email_round_trips_through_decoder() {
        let envelope = Envelope::email("a@example.com", "Sale", "50% off");
        let bytes = envelope.encode().unwrap();

        let decoded = Envelope::decode(&bytes, Some("application/json; charset=utf-8")).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.kind(), Kind::Email);
        assert_eq!(decoded.campaign(), DEFAULT_CAMPAIGN);
    }

    #[test]
    fn missing_campaign_defaults() {
        let body = br#"{"id":"1","createdAt":"2024-05-01T10:00:00Z","kind":"SMS","payload":{"phone":"+1","text":"hi"}}"#;

        let decoded = Envelope::decode(body, None).unwrap();

        assert_eq!(decoded.campaign(), "default");
        assert_eq!(
            decoded.notification(),
            &Notification::Sms(SmsPayload {
                phone: "+1".into(),
                text: "hi".into()
            })
        );
    }

    #[test]
    fn unknown_kind_is_a_decode_error() {
        let body = br#"{"id":"1","createdAt":"2024-05-01T10:00:00Z","kind":"FAX","payload":{}}"#;

        let err = Envelope::decode(body, None).unwrap_err();

        assert!(matches!(err.kind(), DecodeErrorKind::Json(_)));
    }

    #[test]
    fn foreign_content_type_is_refused() {
        let bytes = Envelope::sms("+1", "hi").encode().unwrap();

        let err = Envelope::decode(&bytes, Some("application/xml")).unwrap_err();

        assert!(matches!(
            err.kind(),
            DecodeErrorKind::UnsupportedContentType(ct) if ct == "application/xml"
        ));
    }

    #[test]
    fn invalid_utf8_is_refused() {
        let err = Envelope::decode(&[0xff, 0xfe, 0x00], None).unwrap_err();

        assert!(matches!(err.kind(), DecodeErrorKind::InvalidUtf8(_)));
    }

    #[test]
    fn fresh_envelopes_get_distinct_ids() {
        let a = Envelope::sms("+1", "hi");
        let b = Envelope::sms("+1", "hi");

        assert_ne!(a.id(), b.id());
    }
}
