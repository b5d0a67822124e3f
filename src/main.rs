use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = pgworkbench::run().await {
        tracing::error!(code = err.code(), error = %err, "workbench exited");
        std::process::exit(1);
    }
}
