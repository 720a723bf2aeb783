use super::handlers::{auth, health};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Documented routes. Anything added with `.routes(routes!(...))` is both
/// served and described in `/openapi.json`.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Sign-up, login and session revocation".to_string());

    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Gateway liveness".to_string());

    // utoipa-axum 0.1 has no `get_openapi_mut`; set tags on the base document.
    let mut base = cargo_openapi();
    base.tags = Some(vec![auth_tag, health_tag]);

    OpenApiRouter::with_openapi(base)
        .routes(routes!(health::health))
        .routes(routes!(auth::signup))
        .routes(routes!(auth::login))
        .routes(routes!(auth::logout))
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = optional_str(env!("CARGO_PKG_LICENSE")).map(|identifier| {
        let mut license = License::new(identifier);
        license.identifier = Some(identifier.to_string());
        license
    });

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo joins authors with `;`, each "Name <email>".
    let primary = env!("CARGO_PKG_AUTHORS").split(';').next().map(str::trim)?;
    let (name, email) = match primary.split_once('<') {
        Some((name, email)) => (optional_str(name), optional_str(email.trim_end_matches('>'))),
        None => (optional_str(primary), None),
    };
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn optional_str(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));

        let contact = spec.info.contact.unwrap();
        assert_eq!(contact.name.as_deref(), Some("Team Authmesh"));
        assert_eq!(contact.email.as_deref(), Some("team@authmesh.dev"));
        assert_eq!(spec.info.license.unwrap().name, "BSD-3-Clause");
    }

    #[test]
    fn documents_every_gateway_route() {
        let spec = openapi();
        for path in ["/health", "/auth/signup", "/auth/login", "/auth/logout"] {
            assert!(spec.paths.paths.contains_key(path), "{path}");
        }
        let tags = spec.tags.unwrap_or_default();
        assert!(tags.iter().any(|tag| tag.name == "auth"));
    }
}
