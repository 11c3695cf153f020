use std::process;

// Signal handling and the client endpoint assume a POSIX host.
pub fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: async-messaged runs on POSIX systems only");
        process::exit(2);
    }
}
