// Prompt template library, persisted as YAML so users can edit the system
// messages. Defaults are merged in on every load: missing prompts are
// added, and existing ones are refreshed unless the user has flipped
// `ok_to_replace` off in the file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const PROMPT_SYSTEM_MESSAGE: &str = "prompt_system_message";
pub const SHELL_SYSTEM_MESSAGE: &str = "shell_system_message";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Prompt {
    pub name: String,
    pub prompt: String,
    #[serde(rename = "okToReplace")]
    pub ok_to_replace: bool,
}

fn default_prompts() -> Vec<Prompt> {
    vec![
        Prompt {
            name: PROMPT_SYSTEM_MESSAGE.to_string(),
            prompt: "You are an assistant that helps the user in a Unix shell. \
                     Make your answers technical but succinct."
                .to_string(),
            ok_to_replace: true,
        },
        Prompt {
            name: SHELL_SYSTEM_MESSAGE.to_string(),
            prompt: "You are an assistant that helps the user with a Unix shell. \
                     Give advice about commands that can be run and examples but \
                     keep your answers succinct. Give very short answers for short \
                     or easy questions, in-depth answers for complex questions. You \
                     don't need to tell the user how to install commands that you \
                     mention. It is ok if the user asks questions not directly \
                     related to the unix shell. System info about the local \
                     machine: '{sysinfo}'"
                .to_string(),
            ok_to_replace: true,
        },
    ]
}

/// In-memory library backed by a YAML file.
pub struct PromptLibrary {
    prompts: HashMap<String, Prompt>,
}

impl PromptLibrary {
    /// Load the library from `path`, merge defaults, and write the merged
    /// set back so new defaults reach the file.
    pub fn load(path: &Path) -> Result<Self> {
        let mut prompts: HashMap<String, Prompt> = HashMap::new();
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let listed: Vec<Prompt> = serde_yaml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            for prompt in listed {
                prompts.insert(prompt.name.clone(), prompt);
            }
        }

        let mut changed = !path.exists();
        for default in default_prompts() {
            match prompts.get(&default.name) {
                Some(existing) if !existing.ok_to_replace => {}
                Some(existing) if existing == &default => {}
                _ => {
                    prompts.insert(default.name.clone(), default);
                    changed = true;
                }
            }
        }

        let library = Self { prompts };
        if changed {
            if let Err(err) = library.save(path) {
                tracing::warn!("could not write prompt library: {}", err);
            }
        }
        Ok(library)
    }

    /// Library with just the built-in defaults, nothing touching disk.
    pub fn defaults() -> Self {
        let mut prompts = HashMap::new();
        for prompt in default_prompts() {
            prompts.insert(prompt.name.clone(), prompt);
        }
        Self { prompts }
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut listed: Vec<&Prompt> = self.prompts.values().collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        let yaml = serde_yaml::to_string(&listed)?;
        fs::write(path, yaml).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Fetch a prompt and substitute `{key}` placeholders.
    pub fn get(&self, name: &str, args: &[(&str, &str)]) -> Result<String> {
        let Some(prompt) = self.prompts.get(name) else {
            bail!("no prompt named {:?} in the library", name);
        };
        let mut text = prompt.prompt.clone();
        for (key, value) in args {
            text = text.replace(&format!("{{{}}}", key), value);
        }
        Ok(text)
    }
}

/// `~/.config/butterfish/prompts.yaml`.
pub fn default_library_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".config/butterfish/prompts.yaml"))
}

/// One-line machine description interpolated into the shell system
/// message.
pub fn system_info() -> String {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "unknown".to_string());
    format!(
        "OS {}, architecture {}, user shell {}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        shell
    )
}
