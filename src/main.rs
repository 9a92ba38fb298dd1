mod tproxy;

use clap::Parser;

fn main() {
    let opts = tproxy::Options::parse();

    let cfg = match tproxy::Config::from_options(opts) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = tproxy::run(cfg) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
