use std::{fs, path::Path};

use clap::Parser;
use edge::{
    CatalogSnapshot, EdgeConfig, SharedState, StartAutoDebugRequest, build_admin_app,
    build_data_app, init_logging, refresh_catalog, start_auto_debug,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = EdgeConfig::parse();
    if let Err(err) = config.validate() {
        eprintln!("error: {err}");
        return Err(err.into());
    }

    init_logging()?;
    info!("{}", binary_version_text());

    let state = SharedState::new(&config)?;
    if !state.credentials.is_configured() {
        warn!("no org credentials configured; PUT /credentials on the admin endpoint");
    }

    if let Some(path) = &config.catalog_file {
        let summary = state.catalog.install(load_catalog_file(path)?)?;
        info!(
            "catalog loaded from {} steps={} handler_types={}",
            path.display(),
            summary.indexed_steps,
            summary.handler_types
        );
    }
    if config.fetch_catalog {
        let summary = refresh_catalog(&state).await?;
        info!(
            "catalog fetched from org steps={} handler_types={}",
            summary.indexed_steps, summary.handler_types
        );
    }
    if config.auto_debug {
        start_auto_debug(&state.auto_debug, StartAutoDebugRequest::default())?;
    }

    let data_app = build_data_app(state.clone());
    let admin_app = build_admin_app(state);

    let data_listener = tokio::net::TcpListener::bind(config.data_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(config.admin_addr).await?;

    info!("proxy listening on http://{}", data_listener.local_addr()?);
    info!(
        "admin endpoint listening on http://{}",
        admin_listener.local_addr()?
    );

    let data_server = axum::serve(data_listener, data_app);
    let admin_server = axum::serve(admin_listener, admin_app);

    tokio::select! {
        result = data_server => result?,
        result = admin_server => result?,
    }

    Ok(())
}

fn load_catalog_file(path: &Path) -> Result<CatalogSnapshot, Box<dyn std::error::Error>> {
    let raw = fs::read(path)
        .map_err(|err| format!("failed to read catalog file '{}': {err}", path.display()))?;
    let snapshot = serde_json::from_slice(&raw)
        .map_err(|err| format!("invalid catalog file '{}': {err}", path.display()))?;
    Ok(snapshot)
}

fn binary_version_text() -> String {
    let binary = env!("CARGO_PKG_NAME");
    let git_tag = option_env!("PT_BUILD_GIT_TAG").unwrap_or("untagged");
    let git_commit = option_env!("PT_BUILD_GIT_COMMIT").unwrap_or("unknown");
    let git_dirty = option_env!("PT_BUILD_GIT_DIRTY").unwrap_or("false");
    let dirty = matches!(git_dirty, "true" | "1" | "yes" | "dirty");

    if dirty {
        format!("{binary} {git_tag} (dirty commit: {git_commit})")
    } else {
        format!("{binary} {git_tag}")
    }
}
