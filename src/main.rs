mod catalog;
mod cli;
mod error;
mod library;
mod mapping;
mod rekordbox;
mod table;

fn main() {
    if let Err(err) = cli::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
