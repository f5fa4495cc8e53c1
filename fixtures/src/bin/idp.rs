use clap::Parser;
use fixtures::{
    idp::{router, IdpState},
    run_server, FixtureArgs, IdpConfig,
};

/// Fake OpenID Provider for local development
#[derive(Parser, Debug)]
#[clap(name = "idp-fixture")]
struct Cli {
    #[clap(flatten)]
    common: FixtureArgs,

    #[arg(long, default_value = "test-client")]
    client_id: String,

    #[arg(long, default_value = "test-secret")]
    client_secret: String,

    /// `sub` claim of every issued identity token
    #[arg(long, default_value = "u1")]
    subject: String,

    /// `name` claim of every issued identity token
    #[arg(long, default_value = "Alice")]
    name: String,

    /// Seconds reported as `expires_in`
    #[arg(long, default_value = "3600")]
    expires_in: u64,

    /// Public base URL, when it differs from the bound address
    #[arg(long)]
    issuer: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let listener = cli.common.bind().await?;
    let issuer = match cli.issuer {
        Some(issuer) => issuer.trim_end_matches('/').to_string(),
        None => format!("http://{}", listener.local_addr()?),
    };

    let config = IdpConfig {
        client_id: cli.client_id,
        client_secret: cli.client_secret,
        subject: cli.subject,
        name: cli.name,
        expires_in: Some(cli.expires_in.into()),
        ..Default::default()
    };

    println!("Issuer: {issuer}");
    run_server(listener, router(IdpState::new(config, issuer))).await
}
