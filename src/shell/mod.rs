// The shell multiplexer and its supporting pieces: conversation history,
// token-budget chat assembly, the PS1 sentinel protocol, and the reader
// tasks that frame terminal bytes onto channels.

pub mod assemble;
pub mod history;
pub mod mux;
pub mod ps1;
pub mod readers;

pub use history::{HistoryBlock, HistoryKind, ShellHistory};
pub use mux::{ShellChannels, ShellState, State};
pub use ps1::{parse_ps1, ps1_assignment, ShellKind};
pub use readers::CursorPosition;
