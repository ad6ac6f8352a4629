// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

fn main() {
    if let Err(e) = hammer_lib::cli::run_from_iter(std::env::args()) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
