// Terminal byte-stream plumbing: editable line buffer, ANSI scanning,
// and the colorizing writer used for streamed answers.

pub mod ansi;
pub mod buffer;
pub mod style;

pub use ansi::{incomplete_ansi_sequence, sanitize_tty};
pub use buffer::ShellBuffer;
pub use style::{CarriageReturnWriter, StyleCodeblocksWriter};
