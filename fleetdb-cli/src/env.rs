use tracing::debug;

/// Loads `.env` from the current directory, then `~/.fleetdb/.env`.
///
/// Variables already set are never overwritten.
pub fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        debug!("Loaded .env from current directory: {}", path.display());
    }

    if let Some(home_dir) = dirs::home_dir() {
        let env_file = home_dir.join(".fleetdb").join(".env");
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => debug!("Loaded .env from ~/.fleetdb: {}", env_file.display()),
                Err(e) => debug!("Failed to load ~/.fleetdb/.env: {}", e),
            }
        }
    }
}
