const RESET: &str = "\x1b[0m";
const BANNER_COLOR: &str = "\x1b[38;5;30m";
const DIM_GRAY: &str = "\x1b[2;90m";
const BANNER: &str = r#"
  __ _ ___ _   _ _ __   ___       _ __ ___   ___  ___ ___  __ _  __ _  ___  __| |
 / _` / __| | | | '_ \ / __|_____| '_ ` _ \ / _ \/ __/ __|/ _` |/ _` |/ _ \/ _` |
| (_| \__ \ |_| | | | | (_|_____|| | | | | |  __/\__ \__ \ (_| | (_| |  __/ (_| |
 \__,_|___/\__, |_| |_|\___|     |_| |_| |_|\___||___/___/\__,_|\__, |\___|\__,_|
           |___/                                                |___/            "#;
const APP_DESCRIPTION: &str =
    "Sticky request broker between load-test users and queue-manager / service-bus backends.";

pub fn build_line() -> String {
    format!(
        "{} v{} | build {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("ASYNC_MESSAGED_BUILD_DATE_UTC"),
        env!("ASYNC_MESSAGED_REVISION")
    )
}

pub fn print_startup_banner() {
    println!("{BANNER_COLOR}{BANNER}{RESET}");
    println!("{}", build_line());
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}Transport: length-prefixed JSON over TCP{RESET}");
    println!();
    println!("================================================================");
    println!();
}

#[cfg(test)]
mod tests {
    use super::build_line;

    #[test]
    fn build_line_names_package_and_version() {
        let line = build_line();
        assert!(line.starts_with(concat!(env!("CARGO_PKG_NAME"), " v", env!("CARGO_PKG_VERSION"))));
        assert!(line.contains(" | build "));
    }
}
