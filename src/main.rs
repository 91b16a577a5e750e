#[tokio::main]
async fn main() -> fwfleet::Result<()> {
    fwfleet::init_tracing();
    let mode = fwfleet::parse_command()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?mode,
        "fwfleet starting"
    );
    fwfleet::run(mode).await
}
