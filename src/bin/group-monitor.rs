use std::process::ExitCode;

fn main() -> ExitCode {
    svcinit::si::monitor_cli::run()
}
