use clap::Parser;

fn main() {
    matchdayctl::init_tracing();
    let cli = matchdayctl::Cli::parse();
    if let Err(err) = matchdayctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
