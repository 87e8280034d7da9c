use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use parcel_core::signing::SignedUrlCodec;
use parcel_core::AuthorizedIdentity;
use pretty_assertions::assert_eq;

use crate::api_client::ApiClient;
use crate::commands::auth_cmd::{describe_identity, describe_status, AuthStatus};
use crate::commands::link::{format_expiry, parse_link_target, sign_link, LinkParts};
use crate::error::CliError;

fn codec() -> SignedUrlCodec {
    SignedUrlCodec::new(b"0123456789abcdef0123456789abcdef").unwrap()
}

#[test]
fn signed_link_parses_back_and_verifies() {
    let codec = codec();
    let link = sign_link(
        &codec,
        "file 1",
        Duration::from_secs(900),
        None,
        "https://files.example.com/",
    )
    .unwrap();
    assert!(link
        .url
        .starts_with("https://files.example.com/download/redirect/file%201?expires="));

    let parts = parse_link_target(&link.url, None, None).unwrap();
    assert_eq!(parts.subject, "file 1");
    assert_eq!(parts.expires_at_epoch_ms, link.expires_at_epoch_ms);
    assert!(codec.verify(&parts.subject, parts.expires_at_epoch_ms, &parts.signature, None));
}

#[test]
fn ip_bound_link_needs_the_same_ip() {
    let codec = codec();
    let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
    let link = sign_link(&codec, "f1", Duration::from_secs(60), Some(ip), "http://127.0.0.1:8080").unwrap();
    let parts = parse_link_target(&link.url, None, None).unwrap();
    assert!(codec.verify("f1", parts.expires_at_epoch_ms, &parts.signature, Some(ip)));
    assert!(!codec.verify("f1", parts.expires_at_epoch_ms, &parts.signature, None));
}

#[test]
fn bare_subject_requires_expiry_and_signature() {
    assert!(matches!(
        parse_link_target("f1", None, Some("ab".to_string())),
        Err(CliError::InvalidLink(_))
    ));
    assert_eq!(
        parse_link_target("f1", Some(5), Some("ab".to_string())).unwrap(),
        LinkParts {
            subject: "f1".to_string(),
            expires_at_epoch_ms: 5,
            signature: "ab".to_string(),
        }
    );
}

#[test]
fn rejects_urls_outside_the_redirect_route() {
    assert!(parse_link_target("https://files.example.com/download/f1?expires=1&signature=ab", None, None).is_err());
    assert!(parse_link_target("https://files.example.com/download/redirect/f1?signature=ab", None, None).is_err());
}

#[test]
fn empty_subject_is_rejected() {
    assert!(matches!(
        sign_link(&codec(), "  ", Duration::from_secs(60), None, "http://localhost"),
        Err(CliError::InvalidLink(_))
    ));
}

#[test]
fn expiry_is_rendered_in_utc() {
    assert_eq!(format_expiry(1_700_000_000_000), "2023-11-14 22:13:20 UTC");
}

#[test]
fn status_lines_cover_each_state() {
    let identity = AuthorizedIdentity {
        user_id: 4242,
        display_name: "Relay Account".to_string(),
        username: Some("relay_account".to_string()),
    };
    assert_eq!(describe_identity(&identity), "Relay Account (@relay_account, id 4242)");

    let authorized = AuthStatus {
        authorized: true,
        state: "authorized".to_string(),
        identity: Some(identity),
    };
    assert!(describe_status(&authorized).contains("authorized as Relay Account"));

    let pending = AuthStatus {
        authorized: false,
        state: "code_sent".to_string(),
        identity: None,
    };
    assert!(describe_status(&pending).contains("waiting for a login code"));
}

#[test]
fn api_client_requires_http_base_url() {
    assert!(matches!(
        ApiClient::new("ftp://example.com", "token".to_string()),
        Err(CliError::Config(_))
    ));
    let client = ApiClient::new("http://127.0.0.1:8080/", "secret-operator-token".to_string()).unwrap();
    assert_eq!(client.url("/auth/status"), "http://127.0.0.1:8080/auth/status");
    assert!(!format!("{client:?}").contains("secret-operator-token"));
}
