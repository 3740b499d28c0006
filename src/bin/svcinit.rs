use std::process::ExitCode;

fn main() -> ExitCode {
    svcinit::si::cli::run()
}
