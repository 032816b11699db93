use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "SIMPLODON_LOG";

fn main() {
    if handle_cli_flags() {
        return;
    }

    init_logging();

    if let Err(err) = simplodon::run() {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn handle_cli_flags() -> bool {
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("simplodon {}", simplodon::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!(
                    "simplodon - Render Mastodon timelines as a single HTML page.\n\n\
                     Usage: simplodon [OPTIONS] [ROUTE]\n\n\
                     ROUTE is a page fragment: #public, #public/local, #home, #tags/<tag>,\n\
                     #accounts/<id>, #accounts/@user@host, #settings or #changeserver.\n\n\
                     \x20 --server HOST        Choose the Mastodon server to read from\n\
                     \x20 --login              Authorize with the server in a browser\n\
                     \x20 --logout             Forget the server and its access token\n\
                     \x20 --theme N            Select stylesheet N from the configured themes\n\
                     \x20 --output, -o FILE    Write the page to FILE instead of stdout\n\
                     \x20 --config FILE        Read configuration from FILE\n\
                     \x20 --state FILE         Keep session state in FILE\n\
                     \x20 --version, -V        Show version and exit\n\
                     \x20 --help,    -h        Show this help message\n\n\
                     Set {} to adjust log output (default: warn).",
                    LOG_ENV
                );
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}
