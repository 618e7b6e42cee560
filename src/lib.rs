// Butterfish - shell wrapper with in-line LLM prompting
// Library exports

pub mod config;
pub mod llm; // completion request/response, streaming client, driver
pub mod prompts; // prompt template library (~/.config/butterfish/prompts.yaml)
pub mod pty; // child shell on a pseudoterminal
pub mod shell; // multiplexer, history, chat assembly, PS1 protocol
pub mod term; // line buffer, ANSI scanning, answer colorizer
pub mod tokenizer; // encoder contract + model token tables
