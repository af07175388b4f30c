use depotsync::cli::run_cli;
use depotsync::errors::exit_code_for;

fn main() {
    if let Err(err) = run_cli() {
        eprintln!("error: {err:#}");
        std::process::exit(exit_code_for(&err));
    }
}
