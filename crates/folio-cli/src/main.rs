use clap::Parser;
use folio_cli::Cli;

#[tokio::main]
async fn main() {
    folio_cli::init_tracing();

    let cli = Cli::parse();
    if let Err(e) = cli.execute().await {
        folio_cli::report(&e);
        std::process::exit(folio_cli::exit_code(&e));
    }
}
