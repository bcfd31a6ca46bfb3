use std::sync::Arc;

use jpip_client::api::create_router;
use jpip_client::{init_logging, ClientConfig, LoopbackTransport, RegularCodestream, Session};
use tracing::info;

const DEFAULT_ADDR: &str = "0.0.0.0:3000";

#[tokio::main]
async fn main() -> jpip_client::Result<()> {
    init_logging("info")?;

    // optional JSON config as the only argument
    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::new("sample.jp2"),
    };
    let geometry = RegularCodestream::new(8192, 8192)
        .with_tiles(2048, 2048)
        .with_components(3)
        .with_layers(8)
        .with_mct(true);
    let transport = Arc::new(LoopbackTransport::new(config.target.clone(), geometry));
    let session = Arc::new(Session::new(config, transport)?);
    let prefetch = session.start_prefetch()?;

    let addr = std::env::var("JPIP_API_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!("🚀 JPIP Client API Server");
    println!("📡 Listening on http://{}", addr);
    println!();
    println!("📍 Endpoints:");
    println!("  GET  /api/window?frame_width=<w>&frame_height=<h>&x=<x>&y=<y>&width=<w>&height=<h>");
    println!("  GET  /api/available (same parameters as /api/window)");
    println!("  GET  /api/speed");
    println!("  GET  /api/prefetch");
    println!("  POST /api/close");
    println!();
    info!(target_name = %session.config().target, prefetch = prefetch.is_some(), "Serving loopback target");

    axum::serve(listener, create_router(session, prefetch)).await?;
    Ok(())
}
