#[tokio::main]
async fn main() -> anyhow::Result<()> {
    triage_sync::cli::run().await
}
