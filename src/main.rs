#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eve_copilot_lib::run().await
}
