#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dachs_server::start_server().await
}
