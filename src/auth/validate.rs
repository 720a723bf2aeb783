//! Request validation shared by the engine and the HTTP gateway.

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::fmt;

pub const MAX_PASSWORD_BYTES: usize = 1024;
pub const MAX_FULL_NAME_CHARS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: &'static str,
}

/// One or more rejected fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationError {
    fields: Vec<FieldError>,
}

impl ValidationError {
    #[must_use]
    pub fn single(field: &'static str, message: &'static str) -> Self {
        Self {
            fields: vec![FieldError { field, message }],
        }
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldError] {
        &self.fields
    }

    fn push(&mut self, field: &'static str, message: &'static str) {
        self.fields.push(FieldError { field, message });
    }

    fn into_result<T>(self, value: T) -> Result<T, Self> {
        if self.fields.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for field in &self.fields {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", field.field, field.message)?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Normalize an email for lookup/uniqueness checks.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
#[must_use]
pub fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

fn check_email(errors: &mut ValidationError, raw: &str) -> String {
    let email = normalize_email(raw);
    if email.is_empty() {
        errors.push("email", "email is required");
    } else if !valid_email(&email) {
        errors.push("email", "email is not a valid address");
    }
    email
}

fn check_password(errors: &mut ValidationError, password: &SecretString) {
    let password = password.expose_secret();
    if password.is_empty() {
        errors.push("password", "password is required");
    } else if password.len() > MAX_PASSWORD_BYTES {
        errors.push("password", "password is too long");
    }
}

/// Returns the normalized email.
///
/// # Errors
/// Lists every invalid field.
pub fn login(email: &str, password: &SecretString) -> Result<String, ValidationError> {
    let mut errors = ValidationError::default();
    let email = check_email(&mut errors, email);
    check_password(&mut errors, password);
    errors.into_result(email)
}

/// Returns the normalized email and trimmed full name.
///
/// # Errors
/// Lists every invalid field.
pub fn sign_up(
    email: &str,
    password: &SecretString,
    full_name: &str,
) -> Result<(String, String), ValidationError> {
    let mut errors = ValidationError::default();
    let email = check_email(&mut errors, email);
    check_password(&mut errors, password);

    let full_name = full_name.trim().to_string();
    if full_name.is_empty() {
        errors.push("full_name", "full name is required");
    } else if full_name.chars().count() > MAX_FULL_NAME_CHARS {
        errors.push("full_name", "full name is too long");
    }

    errors.into_result((email, full_name))
}

/// # Errors
/// Rejects an empty refresh token.
pub fn refresh_token(token: &str) -> Result<(), ValidationError> {
    if token.trim().is_empty() {
        return Err(ValidationError::single("refresh_token", "refresh token is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[test]
    fn email_is_normalized() {
        assert_eq!(normalize_email("  Alice@Example.COM "), "alice@example.com");
        assert_eq!(login(" A@X.com", &secret("pw")), Ok("a@x.com".to_string()));
    }

    #[test]
    fn email_format() {
        assert!(valid_email("a@x.com"));
        assert!(!valid_email("a@x"));
        assert!(!valid_email("a x@x.com"));
        assert!(!valid_email("@x.com"));
        assert!(!valid_email(""));
    }

    #[test]
    fn login_reports_every_field() {
        let err = login("nope", &secret("")).unwrap_err();
        let fields: Vec<&str> = err.fields().iter().map(|f| f.field).collect();
        assert_eq!(fields, ["email", "password"]);
        assert_eq!(
            err.to_string(),
            "email: email is not a valid address; password: password is required"
        );
    }

    #[test]
    fn password_length_is_bounded_in_bytes() {
        let at_limit = "é".repeat(MAX_PASSWORD_BYTES / 2);
        assert!(login("a@x.com", &secret(&at_limit)).is_ok());

        let over = format!("{at_limit}x");
        let err = login("a@x.com", &secret(&over)).unwrap_err();
        assert_eq!(err.fields()[0].message, "password is too long");
    }

    #[test]
    fn sign_up_trims_full_name() {
        let (email, name) = sign_up("A@x.com", &secret("pw123"), "  Ann  ").unwrap();
        assert_eq!(email, "a@x.com");
        assert_eq!(name, "Ann");

        let err = sign_up("a@x.com", &secret("pw123"), "   ").unwrap_err();
        assert_eq!(err.fields()[0].field, "full_name");

        let long_name = "n".repeat(MAX_FULL_NAME_CHARS + 1);
        assert!(sign_up("a@x.com", &secret("pw123"), &long_name).is_err());
    }

    #[test]
    fn refresh_token_required() {
        assert!(refresh_token("abc").is_ok());
        assert_eq!(refresh_token(" ").unwrap_err().fields()[0].field, "refresh_token");
    }
}
