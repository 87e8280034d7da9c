use parcel_core::AuthorizedIdentity;
use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::json;

use crate::api_client::ApiClient;
use crate::cli::AuthCommands;
use crate::error::CliError;

#[derive(Debug, Deserialize)]
pub struct AuthStatus {
    pub authorized: bool,
    pub state: String,
    pub identity: Option<AuthorizedIdentity>,
}

#[derive(Debug, Deserialize)]
struct VerifyCodeResponse {
    identity: AuthorizedIdentity,
}

pub async fn run_auth(command: AuthCommands, api_url: Option<String>) -> Result<(), CliError> {
    let client = ApiClient::from_env(api_url)?;
    match command {
        AuthCommands::Status { refresh } => {
            let path = if refresh {
                "/auth/status?refresh=true"
            } else {
                "/auth/status"
            };
            let status: AuthStatus = client.get(path).await?;
            println!("{}", describe_status(&status));
            Ok(())
        }
        AuthCommands::SendCode => {
            let _: IgnoredAny = client.post("/auth/send-code", &json!({})).await?;
            println!("Login code sent. Run `parcel auth verify-code <code>` once it arrives.");
            Ok(())
        }
        AuthCommands::VerifyCode { code } => {
            let response: VerifyCodeResponse = client
                .post("/auth/verify-code", &json!({ "code": code.trim() }))
                .await?;
            println!("Relay session authorized as {}", describe_identity(&response.identity));
            Ok(())
        }
    }
}

pub fn describe_status(status: &AuthStatus) -> String {
    match (&status.identity, status.authorized) {
        (Some(identity), true) => format!("Relay session authorized as {}", describe_identity(identity)),
        _ if status.state == "code_sent" => {
            "Relay session is waiting for a login code (parcel auth verify-code <code>)".to_string()
        }
        _ => "Relay session is not authorized (parcel auth send-code)".to_string(),
    }
}

pub fn describe_identity(identity: &AuthorizedIdentity) -> String {
    identity.username.as_deref().map_or_else(
        || format!("{} (id {})", identity.display_name, identity.user_id),
        |username| format!("{} (@{username}, id {})", identity.display_name, identity.user_id),
    )
}
