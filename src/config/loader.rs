// API-key resolution: flag override, then the butterfish env file, then
// environment variables, then an interactive paste that is saved back to
// the env file for next time.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

const ENV_FILE: &str = ".config/butterfish/butterfish.env";

/// `~/.config/butterfish/butterfish.env`.
pub fn resolve_env_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(ENV_FILE))
}

/// Resolve the API key. A non-empty `override_key` wins; otherwise the env
/// file is loaded and `OPENAI_TOKEN` then `OPENAI_API_KEY` are consulted;
/// otherwise the user is asked to paste one, which is validated and saved.
pub fn load_api_key(override_key: Option<&str>) -> Result<String> {
    if let Some(key) = override_key {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }

    let env_path = resolve_env_path()?;
    // Missing env file is fine, the variables may be set directly.
    let _ = dotenvy::from_path(&env_path);

    for var in ["OPENAI_TOKEN", "OPENAI_API_KEY"] {
        if let Ok(token) = std::env::var(var) {
            if !token.is_empty() {
                return Ok(token);
            }
        }
    }

    prompt_for_key(&env_path)
}

fn prompt_for_key(env_path: &PathBuf) -> Result<String> {
    println!(
        "Butterfish requires an OpenAI API key, please visit \
         https://platform.openai.com/account/api-keys to create one and \
         paste it below (it should start with sk-):"
    );
    let mut token = String::new();
    std::io::stdin()
        .read_line(&mut token)
        .context("failed to read API key from stdin")?;
    let token = token.trim().to_string();
    if token.is_empty() {
        bail!("no token provided");
    }
    if !token.starts_with("sk-") {
        bail!("invalid token provided");
    }

    if let Err(err) = save_key(env_path, &token) {
        // The key still works for this session even if saving failed.
        eprintln!("Error saving token: {}", err);
    } else {
        println!("\nToken saved, you can edit it at any time at {}\n", env_path.display());
    }
    Ok(token)
}

fn save_key(env_path: &PathBuf, token: &str) -> Result<()> {
    if let Some(parent) = env_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(env_path)
        .with_context(|| format!("failed to open {}", env_path.display()))?;
    writeln!(file, "OPENAI_TOKEN={}", token)?;
    Ok(())
}
