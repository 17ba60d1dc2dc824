fn main() {
    if let Err(message) = timesheet_sync::run() {
        eprintln!("error: {message}");
        std::process::exit(1);
    }
}
