use std::{env, net::SocketAddr};

use color_eyre::eyre::WrapErr as _;
use oidc_login::{routes::routes, setup::setup_tracing, state::AppState};
use tracing::info;

const DEFAULT_PORT: u16 = 3000;

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async { run_application().await })
}

async fn run_application() -> color_eyre::Result<()> {
    setup_tracing("oidc_login")?;

    let app_state = AppState::from_env()?;
    let port = listen_port()?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {addr}"))?;

    info!(%addr, callback_path = %app_state.callback_path, "Server listening");
    axum::serve(listener, routes(app_state)).await?;

    Ok(())
}

fn listen_port() -> color_eyre::Result<u16> {
    match env::var("PORT") {
        Ok(port) => port.parse().wrap_err("PORT must be a valid port number"),
        Err(_) => Ok(DEFAULT_PORT),
    }
}
