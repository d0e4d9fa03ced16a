use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    atomstore_cli::main_entry().await
}
