//! Grid Trading Bot Binary
//!
//! Runs one directional grid bot against the paper venue.
//!
//! ## Setup
//!
//! 1. Create a config file (TOML, JSON or YAML), e.g. `grid.toml`:
//!    ```toml
//!    bot_id = "btc-long"
//!
//!    [bot]
//!    symbol = "BTCUSDT"
//!    capital = 50000.0
//!    grid_count = 10
//!    range_pct = 2.0
//!    direction = "long"
//!    leverage = 2
//!    initial_position_pct = 50.0
//!    ```
//!
//! 2. Optionally put overrides in `.env`, e.g. `GRID__BOT__CAPITAL=20000`
//!
//! 3. Run the bot:
//!    ```bash
//!    cargo run --bin grid_bot -- grid.toml
//!    ```

use directional_grid::BotRunner;

#[tokio::main]
async fn main() {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to read .env: {}", e);
        }
    }

    let args: Vec<String> = std::env::args().collect();
    let default_config = "grid.toml".to_string();
    let config_path = args.get(1).unwrap_or(&default_config);
    if !std::path::Path::new(config_path).exists() {
        eprintln!("Config file '{}' not found. Please create one.", config_path);
        std::process::exit(1);
    }

    let runner = match BotRunner::new(config_path) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runner.run().await {
        eprintln!("Bot execution error: {}", e);
        std::process::exit(1);
    }
}
