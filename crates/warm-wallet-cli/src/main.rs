// warm-wallet entry point.
//
// Startup sequence:
// 1. Initialize tracing
// 2. Load config
// 3. Open database (creating its directory if needed)
// 4. Load or create the local wallet
// 5. Load suggesters from the registry (spawns per-suggester pipelines)
// 6. Wait, bounded, for the pipelines to settle
// 7. Log a summary and shut down

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use warm_wallet_core::config;
use warm_wallet_core::state::WarmWallet;

/// Upper bound on how long startup waits for suggester pipelines.
const PIPELINE_GRACE: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("warm-wallet starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: registry {} via {}",
        config.registry.contract_address, config.registry.rpc_url
    );

    // 3. Open database
    if let Some(parent) = Path::new(&config.database.path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let wallet = WarmWallet::from_config(&config)?;
    info!("Database opened at {}", config.database.path);

    // 4. Wallet
    let identity = wallet.load_wallet().context("failed to load wallet")?;
    info!("Wallet address: {}", identity.address());

    // 5. Suggesters
    let suggesters = match wallet.load_suggesters().await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to load suggesters: {}", e);
            return Err(anyhow::Error::new(e).context("failed to load suggesters"));
        }
    };
    for s in &suggesters {
        info!("Suggester {} ({}) at {}", s.name, s.address, s.url);
    }

    // 6. Wait for pipelines
    let deadline = tokio::time::Instant::now() + PIPELINE_GRACE;
    let (outcomes, running) = wallet.join_pipelines_until(deadline).await;
    let ok = outcomes.iter().filter(|o| o.result.is_ok()).count();
    info!("{} of {} finished suggester pipelines succeeded", ok, outcomes.len());
    if running > 0 {
        warn!(
            "{} suggester pipelines still running after {:?}; aborting them",
            running, PIPELINE_GRACE
        );
    }

    // 7. Summary and cleanup
    for (url, live) in wallet.session_statuses() {
        info!("Session {}: {}", url, if live { "connected" } else { "not connected" });
    }
    info!("{} answers cached", wallet.answers().len());

    wallet.shutdown();
    info!("warm-wallet shut down cleanly");
    Ok(())
}

/// Initialize tracing to stderr, filtered by `RUST_LOG`.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warm_wallet=info,warm_wallet_core=info,warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
