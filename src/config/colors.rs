// Terminal color schemes for the wrapper's own output: the prompt being
// typed, echoed commands, streamed answers, highlighted code, and errors.

/// ANSI SGR strings for each kind of wrapper output.
#[derive(Debug, Clone)]
pub struct ShellColorScheme {
    pub prompt: &'static str,
    pub command: &'static str,
    pub answer: &'static str,
    pub answer_highlight: &'static str,
    pub error: &'static str,
}

impl ShellColorScheme {
    /// Default scheme for dark terminal backgrounds.
    pub fn dark() -> Self {
        Self {
            prompt: "\x1b[38;5;154m",
            command: "\x1b[0m",
            answer: "\x1b[38;5;221m",
            answer_highlight: "\x1b[38;5;204m",
            error: "\x1b[38;5;196m",
        }
    }

    /// Scheme for terminals with a white(ish) background.
    pub fn light() -> Self {
        Self {
            prompt: "\x1b[38;5;28m",
            command: "\x1b[0m",
            answer: "\x1b[38;5;18m",
            answer_highlight: "\x1b[38;5;6m",
            error: "\x1b[38;5;196m",
        }
    }

    pub fn for_dark_background(dark: bool) -> Self {
        if dark {
            Self::dark()
        } else {
            Self::light()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schemes_differ_where_it_matters() {
        let dark = ShellColorScheme::dark();
        let light = ShellColorScheme::light();
        assert_ne!(dark.prompt, light.prompt);
        assert_ne!(dark.answer, light.answer);
        // Error red works on both backgrounds
        assert_eq!(dark.error, light.error);
    }

    #[test]
    fn test_command_color_is_reset() {
        assert_eq!(ShellColorScheme::dark().command, "\x1b[0m");
    }
}
