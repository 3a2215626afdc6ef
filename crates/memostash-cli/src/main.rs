//! Maintenance tool for memostash stores.

mod cli;
mod output;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            memostash::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
