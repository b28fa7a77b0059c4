use std::process::ExitCode;

mod app;
mod cli;
mod config;

fn main() -> anyhow::Result<ExitCode> {
    app::run()
}
