use std::env;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parcel_core::signing::SignedUrlCodec;
use serde::Serialize;
use url::Url;

use crate::error::CliError;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedLink {
    pub url: String,
    pub expires_at_epoch_ms: i64,
    pub signature: String,
}

/// Subject, expiry and signature pulled out of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkParts {
    pub subject: String,
    pub expires_at_epoch_ms: i64,
    pub signature: String,
}

pub fn run_sign(
    subject: &str,
    ttl_secs: u64,
    client_ip: Option<IpAddr>,
    base_url: Option<String>,
    as_json: bool,
) -> Result<(), CliError> {
    let codec = codec_from_env()?;
    let base_url = base_url
        .or_else(|| env::var("PARCEL_PUBLIC_BASE_URL").ok())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let link = sign_link(&codec, subject, Duration::from_secs(ttl_secs), client_ip, &base_url)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&link)?);
    } else {
        println!("{}", link.url);
        println!("expires {}", format_expiry(link.expires_at_epoch_ms));
    }
    Ok(())
}

pub fn run_verify(
    target: &str,
    expires: Option<i64>,
    signature: Option<String>,
    client_ip: Option<IpAddr>,
) -> Result<(), CliError> {
    let codec = codec_from_env()?;
    let parts = parse_link_target(target, expires, signature)?;
    codec.check(
        &parts.subject,
        parts.expires_at_epoch_ms,
        &parts.signature,
        client_ip,
    )?;
    println!(
        "Link for '{}' is valid until {}",
        parts.subject,
        format_expiry(parts.expires_at_epoch_ms)
    );
    Ok(())
}

pub fn sign_link(
    codec: &SignedUrlCodec,
    subject: &str,
    ttl: Duration,
    client_ip: Option<IpAddr>,
    base_url: &str,
) -> Result<SignedLink, CliError> {
    let subject = subject.trim();
    if subject.is_empty() {
        return Err(CliError::InvalidLink("Subject cannot be empty".to_string()));
    }
    let token = codec.issue(subject, ttl, client_ip);
    Ok(SignedLink {
        url: token.redirect_url(base_url.trim_end_matches('/'))?,
        expires_at_epoch_ms: token.expires_at_epoch_ms,
        signature: token.signature_hex,
    })
}

/// Accept either a full `/download/redirect/<id>?expires=..&signature=..`
/// URL or a bare subject plus explicit expiry and signature.
pub fn parse_link_target(
    target: &str,
    expires: Option<i64>,
    signature: Option<String>,
) -> Result<LinkParts, CliError> {
    let target = target.trim();
    if !(target.starts_with("http://") || target.starts_with("https://")) {
        let expires_at_epoch_ms = expires.ok_or_else(|| {
            CliError::InvalidLink("--expires is required with a bare file id".to_string())
        })?;
        let signature = signature.ok_or_else(|| {
            CliError::InvalidLink("--signature is required with a bare file id".to_string())
        })?;
        return Ok(LinkParts {
            subject: target.to_string(),
            expires_at_epoch_ms,
            signature,
        });
    }

    let url = Url::parse(target).map_err(|error| CliError::InvalidLink(error.to_string()))?;
    let segments: Vec<&str> = url
        .path_segments()
        .map(Iterator::collect)
        .unwrap_or_default();
    let subject = match segments.as_slice() {
        [.., "download", "redirect", subject] if !subject.is_empty() => urlencoding::decode(subject)
            .map_err(|error| CliError::InvalidLink(error.to_string()))?
            .into_owned(),
        _ => {
            return Err(CliError::InvalidLink(
                "URL path must end in /download/redirect/<id>".to_string(),
            ))
        }
    };

    let mut query_expires = None;
    let mut query_signature = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "expires" => query_expires = Some(value.into_owned()),
            "signature" => query_signature = Some(value.into_owned()),
            _ => {}
        }
    }
    let expires_at_epoch_ms = query_expires
        .and_then(|value| value.parse::<i64>().ok())
        .ok_or_else(|| CliError::InvalidLink("URL has no numeric expires parameter".to_string()))?;
    let signature = query_signature
        .ok_or_else(|| CliError::InvalidLink("URL has no signature parameter".to_string()))?;

    Ok(LinkParts {
        subject,
        expires_at_epoch_ms,
        signature,
    })
}

pub fn format_expiry(expires_at_epoch_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(expires_at_epoch_ms).map_or_else(
        || format!("at {expires_at_epoch_ms} ms"),
        |at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

fn codec_from_env() -> Result<SignedUrlCodec, CliError> {
    let secret = env::var("DOWNLOAD_SIGNING_SECRET")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| CliError::Config("DOWNLOAD_SIGNING_SECRET is not set".to_string()))?;
    if secret.len() < MIN_SECRET_LEN {
        return Err(CliError::Config(format!(
            "DOWNLOAD_SIGNING_SECRET must be at least {MIN_SECRET_LEN} characters"
        )));
    }
    Ok(SignedUrlCodec::new(secret.as_bytes())?)
}
