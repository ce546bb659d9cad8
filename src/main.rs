#[tokio::main]
async fn main() {
    if let Err(err) = archstrap::run().await {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}
