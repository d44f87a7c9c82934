use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = crosspostctl::Cli::parse();
    crosspostctl::init_tracing(&cli.log_level);
    match crosspostctl::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(crosspostctl::EXIT_FATAL);
        }
    }
}
