use pacer::echo::EchoServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("pacer=info,heartbeat_server=info")
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(10086);

    let server = EchoServer::bind(("0.0.0.0", port)).await?;
    server.run().await
}
