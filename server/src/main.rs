#[tokio::main]
async fn main() -> anyhow::Result<()> {
    campaign_dialer::run().await
}
