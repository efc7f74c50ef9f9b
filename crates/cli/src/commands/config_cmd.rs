//! `agentwire config`: Print the default configuration.

use agentwire_config::AppConfig;

pub fn run(path: bool) {
    if path {
        println!("{}", config_path().display());
    } else {
        print!("{}", AppConfig::default_toml());
    }
}

fn config_path() -> std::path::PathBuf {
    AppConfig::config_dir().join("config.toml")
}
