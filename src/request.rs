//! Inbound identify requests.
//!
//! Requests arrive as loosely-typed JSON (`phoneNumber` may be a number or a
//! string). [`IdentifyRequest::validate`] normalizes them into an
//! [`Identity`], the only shape the reconciliation core accepts.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ValidationError;

/// Longest accepted identifier, in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 320;

static EMAIL_RE: OnceLock<Regex> = OnceLock::new();

fn email_regex() -> &'static Regex {
    EMAIL_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_'+\-.]*[A-Za-z0-9_+\-]@([A-Za-z0-9][A-Za-z0-9\-]*\.)+[A-Za-z]{2,}$")
            .unwrap_or_else(|e| unreachable!("static email regex is valid: {e}"))
    })
}

/// Syntactic email check.
#[must_use]
pub fn is_valid_email(value: &str) -> bool {
    !value.starts_with('.') && !value.contains("..") && email_regex().is_match(value)
}

fn phone_from_json<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_json::Value;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => phone_digits(&n)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("phoneNumber must be an integer, got {n}"))),
        Some(other) => Err(D::Error::custom(format!(
            "phoneNumber must be a string or number, got {other}"
        ))),
    }
}

/// Decimal digits of an integral JSON number. `1e3` and `123.0` are
/// integral; `12.5` is not.
fn phone_digits(n: &serde_json::Number) -> Option<String> {
    if let Some(v) = n.as_u64() {
        return Some(v.to_string());
    }
    if let Some(v) = n.as_i64() {
        return Some(v.to_string());
    }
    // Beyond 2^53 a float no longer holds a whole number exactly.
    const EXACT: f64 = 9_007_199_254_740_992.0;
    let f = n.as_f64()?;
    (f.fract() == 0.0 && f.abs() <= EXACT).then(|| format!("{:.0}", f + 0.0))
}

/// Raw identify request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    /// Email address.
    #[serde(default)]
    pub email: Option<String>,
    /// Phone number; JSON numbers are accepted and stringified.
    #[serde(default, deserialize_with = "phone_from_json")]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    /// Empty request; add identifiers with the `with_*` methods.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the email.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the phone number.
    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone_number = Some(phone.into());
        self
    }

    /// Normalizes and validates the request.
    ///
    /// Values are trimmed and blank values count as absent.
    ///
    /// # Errors
    /// - `MissingIdentifier` if neither identifier remains
    /// - `InvalidEmail` if the email fails the syntax check
    /// - `FieldTooLong` if a value exceeds [`MAX_IDENTIFIER_LEN`]
    pub fn validate(&self) -> Result<Identity, ValidationError> {
        let email = match self.email.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(e) => {
                check_len("email", e)?;
                if !is_valid_email(e) {
                    return Err(ValidationError::InvalidEmail {
                        value: e.to_string(),
                    });
                }
                Some(e.to_string())
            }
        };

        let phone_number = match self.phone_number.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(p) => {
                check_len("phoneNumber", p)?;
                Some(p.to_string())
            }
        };

        if email.is_none() && phone_number.is_none() {
            return Err(ValidationError::MissingIdentifier);
        }

        Ok(Identity {
            email,
            phone_number,
        })
    }
}

fn check_len(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::FieldTooLong {
            field: field.to_string(),
            max_length: MAX_IDENTIFIER_LEN,
        });
    }
    Ok(())
}

/// A validated request: at least one non-blank identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Identity {
    /// The email, if supplied.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// The phone number, if supplied.
    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}
