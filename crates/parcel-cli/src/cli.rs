use std::net::IpAddr;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "parcel")]
#[command(about = "Issue signed download links and manage the relay session")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Base URL of a running parcel-api (defaults to PARCEL_API_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub api_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign a download link offline with DOWNLOAD_SIGNING_SECRET
    Sign {
        /// File id the link authorizes
        subject: String,
        /// Link lifetime in seconds
        #[arg(long, default_value = "900")]
        ttl_secs: u64,
        /// Bind the link to one client address
        #[arg(long, value_name = "IP")]
        client_ip: Option<IpAddr>,
        /// Public base URL the link points at (defaults to PARCEL_PUBLIC_BASE_URL)
        #[arg(long, value_name = "URL")]
        base_url: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a signed link offline with DOWNLOAD_SIGNING_SECRET
    Verify {
        /// Full signed URL, or a bare file id with --expires and --signature
        target: String,
        #[arg(long)]
        expires: Option<i64>,
        #[arg(long)]
        signature: Option<String>,
        /// Client address the link was bound to
        #[arg(long, value_name = "IP")]
        client_ip: Option<IpAddr>,
    },
    /// Drive the relay account handshake on a running API
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Show whether the relay session is authorized
    Status {
        /// Ask the backend instead of the cached session state
        #[arg(long)]
        refresh: bool,
    },
    /// Send a login code to the relay account's phone
    SendCode,
    /// Complete the handshake with the received code
    VerifyCode {
        /// Code delivered to the relay account
        code: String,
    },
}
