use std::future::IntoFuture;
use std::sync::Arc;

use switchboard_llm::{persist, AppState, SystemClock};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().ok_or(
        "usage: switchboard-gateway <config.json> [--listen HOST:PORT] [--usage-file PATH] [--admin-token TOKEN]",
    )?;

    let mut listen = "127.0.0.1:8080".to_string();
    let mut usage_file = "usage.json".to_string();
    let mut admin_token: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--usage-file" => {
                usage_file = args.next().ok_or("missing value for --usage-file")?;
            }
            "--admin-token" => {
                admin_token = Some(args.next().ok_or("missing value for --admin-token")?);
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let clock = Arc::new(SystemClock::new());
    let config = persist::load_config(&config_path)?;

    let mut state = AppState::new(config, clock.clone() as _)?.with_config_path(&config_path);
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    }

    state.counters.import(persist::load_usage_snapshot(&usage_file));

    tokio::spawn(switchboard_llm::probe::run_probe_loop(
        Arc::clone(&state.registry),
        Arc::clone(&state.health),
        clock as _,
    ));
    tokio::spawn(persist::run_usage_flush(
        Arc::clone(&state.counters),
        usage_file.clone().into(),
    ));

    let counters = Arc::clone(&state.counters);
    let app = switchboard_llm::router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "switchboard-gateway listening");

    let serve = axum::serve(listener, app).into_future();
    tokio::select! {
        result = serve => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down; flushing usage snapshot");
            if let Err(err) = persist::save_usage_snapshot(&usage_file, &counters.export()) {
                tracing::warn!(error = %err, "final usage snapshot write failed");
            }
        }
    }
    Ok(())
}
