use collabpad::config::Config;
use collabpad::server::Server;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .init();

    tracing::info!(?config, "starting collabpad server");

    let server = Server::new(config)?;
    server.run()?;

    Ok(())
}
