use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use txsentry::config::AuditConfig;
use txsentry::server;

#[tokio::main]
async fn main() -> miette::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("txsentry=info")),
        )
        .init();

    let mut builder = AuditConfig::builder();
    if let Ok(path) = std::env::var("TXSENTRY_CONFIG") {
        builder = builder.with_file(&path).into_diagnostic()?;
    }
    // Env overrides win over the profile file.
    let config = builder.with_env().build().into_diagnostic()?;

    server::serve(config).await.into_diagnostic()?;
    Ok(())
}
