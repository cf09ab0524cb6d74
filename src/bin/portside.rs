//! Facade-mode entry point: start the echo server, wait for a line on
//! standard input, shut down.

use portside::config::ServerConfig;
use portside::server::Server;
use std::io::BufRead;
use std::process::ExitCode;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("========================================");
    println!("portside {}", env!("CARGO_PKG_VERSION"));
    println!("========================================");

    let mut server = Server::new(ServerConfig::default());
    if let Err(e) = server.start() {
        tracing::error!(error = %e, "server failed to start");
        return ExitCode::from(1);
    }
    if let Some(addr) = server.local_addr() {
        println!("listening on {addr} — press Enter to stop");
    }

    let mut line = String::new();
    let _ = std::io::stdin().lock().read_line(&mut line);

    server.stop();
    let stats = server.stats();
    println!(
        "sessions accepted: {}, closed: {}, bytes in/out: {}/{}",
        stats.sessions_accepted(),
        stats.sessions_closed(),
        stats.bytes_received(),
        stats.bytes_sent(),
    );
    ExitCode::SUCCESS
}
