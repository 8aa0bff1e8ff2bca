#[tokio::main]
async fn main() -> anyhow::Result<()> {
    store_api::run_server().await
}
