use tracing_subscriber::EnvFilter;

fn main() {
    if handle_cli_flags() {
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(err) = alris_client::run(&args) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Global flags are only recognised in first position; later arguments
/// belong to the subcommand.
fn handle_cli_flags() -> bool {
    match std::env::args().nth(1).as_deref() {
        Some("--version" | "-V") => {
            println!("ALRIS {}", alris_client::VERSION);
            true
        }
        Some("--help" | "-h") => {
            println!("{}", alris_client::app::USAGE);
            true
        }
        _ => false,
    }
}
