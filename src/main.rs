fn main() {
    if let Err(e) = fleetstream::run() {
        tracing::error!("fleetstream failed: {e}");
        eprintln!("fleetstream: {e}");
        std::process::exit(1);
    }
}
