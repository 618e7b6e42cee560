// ANSI escape-sequence scanning helpers.
//
// Terminal input arrives in arbitrary read-sized frames, so a CSI
// sequence can be split across two frames. `incomplete_ansi_sequence`
// tells the multiplexer whether a frame ends mid-sequence and must be
// held back until more bytes arrive.

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Ground,
    Escape,
    Csi,
}

/// True iff `data` ends in the middle of an ANSI escape sequence (a bare
/// `ESC`, or `ESC [` with no final byte yet).
pub fn incomplete_ansi_sequence(data: &[u8]) -> bool {
    let mut state = ScanState::Ground;
    for &b in data {
        state = match state {
            ScanState::Ground => {
                if b == 0x1b {
                    ScanState::Escape
                } else {
                    ScanState::Ground
                }
            }
            ScanState::Escape => {
                if b == b'[' {
                    ScanState::Csi
                } else {
                    // Two-character escape, complete.
                    ScanState::Ground
                }
            }
            ScanState::Csi => match b {
                0x40..=0x7e => ScanState::Ground,
                _ => ScanState::Csi,
            },
        };
    }
    state != ScanState::Ground
}

/// Strip escape sequences and non-whitespace control bytes, leaving
/// printable text. Used before history content is logged or packed into
/// an LLM request.
pub fn sanitize_tty(data: &str) -> String {
    let bytes = data.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut state = ScanState::Ground;
    for &b in bytes {
        match state {
            ScanState::Ground => {
                if b == 0x1b {
                    state = ScanState::Escape;
                } else if b >= 0x20 || b == b'\n' || b == b'\r' || b == b'\t' {
                    out.push(b);
                }
            }
            ScanState::Escape => {
                state = if b == b'[' {
                    ScanState::Csi
                } else {
                    ScanState::Ground
                };
            }
            ScanState::Csi => {
                if let 0x40..=0x7e = b {
                    state = ScanState::Ground;
                }
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
