//! `convoy init` — create the data dir layout and a default config.

use std::path::Path;

use crate::config::Config;
use crate::paths;

pub fn run(data_dir: &Path, force: bool) -> anyhow::Result<()> {
    println!();

    paths::ensure_dirs_in(data_dir)?;
    println!("  Created {}/", data_dir.display());

    let config_path = paths::config_path_in(data_dir);
    if config_path.exists() && !force {
        println!(
            "  Config already exists at {} (use --force to overwrite)",
            config_path.display()
        );
    } else {
        std::fs::write(&config_path, Config::default().render()?)?;
        println!("  Config written to {}", config_path.display());
    }

    println!();
    println!("  Next steps:");
    println!("    1. Set [broker].url in the config (or CONVOY_BROKER_URL) to join peers");
    println!("    2. Start Convoy:  convoy start");
    println!();

    Ok(())
}
