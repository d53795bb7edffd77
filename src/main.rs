use framecast::config::Config;
use framecast::runtime::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        mailbox_workers = config.mailbox_workers,
        echo_to_sender = config.echo_to_sender,
        max_frame_length = ?config.max_frame_length,
        "Starting framecast server"
    );

    let server = Server::bind(config)?;
    server.run()?;
    Ok(())
}
