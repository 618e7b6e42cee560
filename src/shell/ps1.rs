// Custom PS1 protocol: the child shell's prompt is wrapped in sentinel
// escape bytes so prompt boundaries and the previous command's exit status
// can be recovered from arbitrary output. The sentinels (`ESC Q` before,
// ` <status> ESC R` after) lie outside anything a program would print.

use once_cell::sync::Lazy;
use regex::Regex;

pub const PROMPT_PREFIX: &str = "\x1bQ";
pub const PROMPT_SUFFIX: &str = "\x1bR";
pub const PROMPT_PREFIX_ESCAPED: &str = "\\033Q";
pub const PROMPT_SUFFIX_ESCAPED: &str = "\\033R";
pub const EMOJI_DEFAULT: &str = "🐠";

static PS1_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(" ([0-9]+){}", PROMPT_SUFFIX)).unwrap());
static PS1_FULL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("{} ([0-9]+){}", EMOJI_DEFAULT, PROMPT_SUFFIX)).unwrap());

/// Result of scanning one chunk of child output for prompt sentinels.
#[derive(Debug, PartialEq, Eq)]
pub struct Ps1Scan {
    /// Exit status of the previous command, from the last match.
    pub last_status: i32,
    /// Number of prompts seen in the chunk.
    pub prompts: usize,
    /// The chunk with sentinels stripped (suffix replaced by the icon).
    pub cleaned: String,
}

/// Shell kinds we know how to install a PS1 for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Sh,
    Zsh,
    Unknown,
}

impl ShellKind {
    /// Classify a shell binary path like `/bin/zsh`.
    pub fn from_binary(path: &str) -> Self {
        let base = path.rsplit('/').next().unwrap_or(path);
        match base {
            "bash" => ShellKind::Bash,
            "sh" => ShellKind::Sh,
            "zsh" => ShellKind::Zsh,
            _ => ShellKind::Unknown,
        }
    }
}

/// The PS1 assignment line to send to the child shell, or `None` for
/// unknown shells (which are left alone — prompt detection and exit-status
/// capture are unavailable, but the wrapper still works).
pub fn ps1_assignment(kind: ShellKind, leave_prompt_alone: bool) -> Option<String> {
    let icon = if leave_prompt_alone { "" } else { EMOJI_DEFAULT };
    match kind {
        ShellKind::Bash | ShellKind::Sh => Some(format!(
            "PS1=$'\\[{}\\]'$PS1$'{}\\[ $?{}\\] '\n",
            PROMPT_PREFIX_ESCAPED, icon, PROMPT_SUFFIX_ESCAPED
        )),
        ShellKind::Zsh => Some(format!(
            "PS1=$'%{{{}%}}'$PS1$'{}%{{ %?{}%}} '\n",
            PROMPT_PREFIX_ESCAPED, icon, PROMPT_SUFFIX_ESCAPED
        )),
        ShellKind::Unknown => None,
    }
}

/// Scan child output for the trailing sentinel pattern, counting prompts,
/// extracting the last exit status, and stripping both sentinel forms from
/// the text that will reach the parent terminal.
pub fn parse_ps1(data: &str, leave_prompt_alone: bool) -> Ps1Scan {
    let (regex, icon): (&Regex, &str) = if leave_prompt_alone {
        (&PS1_REGEX, "")
    } else {
        (&PS1_FULL_REGEX, EMOJI_DEFAULT)
    };

    let mut last_status = 0;
    let mut prompts = 0;
    for capture in regex.captures_iter(data) {
        match capture[1].parse::<i32>() {
            Ok(status) => last_status = status,
            Err(err) => tracing::warn!("error parsing PS1 match: {}", err),
        }
        prompts += 1;
    }

    if prompts == 0 {
        return Ps1Scan {
            last_status: 0,
            prompts: 0,
            cleaned: data.to_string(),
        };
    }

    let cleaned = regex.replace_all(data, icon).replace(PROMPT_PREFIX, "");
    Ps1Scan {
        last_status,
        prompts,
        cleaned,
    }
}

/// zsh clears formatting and the rest of the line with this sequence
/// before printing a prompt; such chunks are noise and stay out of
/// history.
static ZSH_CLEAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^\x1b\\[1m\x1b\\[3m%\x1b\\[23m\x1b\\[1m\x1b\\[0m\x20+\x0d\x20\x0d").unwrap()
});

pub fn is_zsh_clear_noise(data: &str) -> bool {
    data.starts_with("\x1b[1m") && ZSH_CLEAR_REGEX.is_match(data)
}
