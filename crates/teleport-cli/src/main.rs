#![forbid(unsafe_code)]

fn main() {
    std::process::exit(teleport_cli::run());
}
