use colored::Colorize;

pub mod crawl;
pub mod report;

pub fn print_banner() {
    let banner = r#"
     _             _                _       _
 ___| |_ __ _  ___| | ___ __  _ __(_)_ __ | |_
/ __| __/ _` |/ __| |/ / '_ \| '__| | '_ \| __|
\__ \ || (_| | (__|   <| |_) | |  | | | | | |_
|___/\__\__,_|\___|_|\_\ .__/|_|  |_|_| |_|\__|
                       |_|
"#;
    eprintln!("{}", banner.bright_cyan().bold());
    eprintln!(
        "{}\n",
        format!("  technology fingerprinting crawler v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
}
