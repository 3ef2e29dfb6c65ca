use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    vsa_cli::cli::cli().await
}
