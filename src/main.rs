#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = scriptmark::run_worker().await {
        eprintln!("scriptmark-worker fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
