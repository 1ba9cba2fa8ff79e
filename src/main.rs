fn main() {
    if let Err(error) = coin_tracker_lib::run() {
        eprintln!("coin-tracker failed: {error}");
        std::process::exit(1);
    }
}
