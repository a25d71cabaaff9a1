mod cli;
mod config;
mod logging;
mod pidfile;
mod runner;
mod signals;
mod supervisor;
mod worker;

#[tokio::main]
async fn main() {
    let mut out = std::io::stdout();
    let mut err = std::io::stderr();
    let code = cli::run(std::env::args_os().collect(), &mut out, &mut err).await;
    std::process::exit(code);
}
