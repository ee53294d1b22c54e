use std::time::Duration;

use clap::Parser;
use tokenkeep::{
    sources::oauth2::ReqwestClientCredentialsClient, supplier, CancellationToken, ClientId,
    ClientSecret, TokenError,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The issuing authority's base URL
    #[arg(short, long, env)]
    authority_url: reqwest::Url,

    /// The token endpoint, relative to the authority's base URL
    #[arg(long, env, default_value = tokenkeep::sources::oauth2::DEFAULT_TOKEN_PATH)]
    token_path: String,

    /// The client ID of the client
    #[arg(short, long, env)]
    client_id: ClientId,

    /// The client secret used to identify the client to the issuing authority
    #[arg(short = 's', long, env, hide_env_values = true)]
    client_secret: ClientSecret,

    /// How long, in seconds, an issued token remains usable
    #[arg(short, long, env, default_value_t = 60)]
    ttl_secs: u64,

    /// Send credentials as JSON instead of form data
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let http = reqwest::Client::builder().build()?;
    let client = ReqwestClientCredentialsClient::with_base_url_and_path(
        http,
        &opts.authority_url,
        &opts.token_path,
    )?;
    tracing::info!(token_url = %client.token_url(), "requesting tokens");

    let shutdown = CancellationToken::new();
    let ttl = Duration::from_secs(opts.ttl_secs);

    let tokens = if opts.json {
        supplier::spawn_client_credentials(
            client.using_json(),
            opts.client_id,
            opts.client_secret,
            ttl,
            shutdown.clone(),
        )
    } else {
        supplier::spawn_client_credentials(
            client,
            opts.client_id,
            opts.client_secret,
            ttl,
            shutdown.clone(),
        )
    };

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
            }
            shutdown.cancel();
        }
    });

    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match tokens.token(&shutdown).await {
            Ok(token) => {
                tracing::info!(token = format_args!("{:#?}", token), "pulled token")
            }
            Err(TokenError::Cancelled { .. }) => break,
            Err(err @ TokenError::ExpiredPending { .. }) => {
                tracing::warn!(error = (&err as &dyn std::error::Error), "token is stale")
            }
            Err(err) => {
                tracing::error!(error = (&err as &dyn std::error::Error), "no usable token")
            }
        }
    }

    Ok(())
}
