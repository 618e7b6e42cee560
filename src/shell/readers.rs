// Reader tasks that frame raw bytes onto channels for the multiplexer's
// select loop. The parent-terminal reader also demultiplexes inline
// cursor-position reports (`ESC [ row ; col R`), which the terminal mixes
// into the ordinary input stream in response to a DSR request.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

const READ_BUF_SIZE: usize = 4096;
/// A held-back DSR candidate longer than this can't be a real report;
/// flush it as ordinary input.
const MAX_DSR_CANDIDATE: usize = 16;

/// Cursor position from a Device Status Report, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPosition {
    pub row: usize,
    pub col: usize,
}

/// Forward frames from `reader` until EOF or error; dropping the sender
/// signals the multiplexer that the stream closed.
pub async fn reader_to_channel<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!("reader closed: {}", err);
                break;
            }
        }
    }
}

/// Like `reader_to_channel`, but cursor-position reports are stripped out
/// of the stream and sent on `pos_tx` instead. A report split across two
/// reads is held back until the next frame completes or disproves it.
pub async fn reader_to_channel_with_position<R>(
    mut reader: R,
    tx: mpsc::Sender<Vec<u8>>,
    pos_tx: mpsc::Sender<CursorPosition>,
) where
    R: AsyncRead + Unpin,
{
    let mut held: Vec<u8> = Vec::new();
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => {
                if !held.is_empty() {
                    let _ = tx.send(held).await;
                }
                break;
            }
            Ok(n) => {
                let mut data = std::mem::take(&mut held);
                data.extend_from_slice(&buf[..n]);
                let scan = extract_cursor_reports(&data);
                held = scan.held;
                for position in scan.positions {
                    // The position channel is deliberately loose; drop on
                    // the floor rather than stall input.
                    let _ = pos_tx.try_send(position);
                }
                if !scan.forward.is_empty() && tx.send(scan.forward).await.is_err() {
                    break;
                }
            }
        }
    }
}

pub(crate) struct DsrScan {
    pub positions: Vec<CursorPosition>,
    pub forward: Vec<u8>,
    pub held: Vec<u8>,
}

enum DsrParse {
    Report(CursorPosition, usize),
    Partial,
    NotReport,
}

/// Split complete cursor reports out of `data`; a trailing partial report
/// is returned in `held`.
pub(crate) fn extract_cursor_reports(data: &[u8]) -> DsrScan {
    let mut positions = Vec::new();
    let mut forward = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x1b {
            match parse_dsr(&data[i..]) {
                DsrParse::Report(position, len) => {
                    positions.push(position);
                    i += len;
                    continue;
                }
                DsrParse::Partial if data.len() - i <= MAX_DSR_CANDIDATE => {
                    return DsrScan {
                        positions,
                        forward,
                        held: data[i..].to_vec(),
                    };
                }
                _ => {}
            }
        }
        forward.push(data[i]);
        i += 1;
    }
    DsrScan {
        positions,
        forward,
        held: Vec::new(),
    }
}

/// Shift a decimal digit into `value`; `None` means the number is too
/// large to be a real cursor coordinate.
fn accumulate_digit(value: usize, digit: u8) -> Option<usize> {
    value
        .checked_mul(10)?
        .checked_add(usize::from(digit - b'0'))
}

/// Try to parse `ESC [ digits ; digits R` at the start of `bytes`.
fn parse_dsr(bytes: &[u8]) -> DsrParse {
    debug_assert_eq!(bytes[0], 0x1b);
    let mut i = 1;
    let mut row = 0usize;
    let mut col = 0usize;

    match bytes.get(i) {
        None => return DsrParse::Partial,
        Some(b'[') => i += 1,
        Some(_) => return DsrParse::NotReport,
    }

    let mut any = false;
    while let Some(&b) = bytes.get(i) {
        if b.is_ascii_digit() {
            row = match accumulate_digit(row, b) {
                Some(value) => value,
                None => return DsrParse::NotReport,
            };
            any = true;
            i += 1;
        } else {
            break;
        }
    }
    match bytes.get(i) {
        None => return DsrParse::Partial,
        Some(b';') if any => i += 1,
        Some(_) => return DsrParse::NotReport,
    }

    let mut any = false;
    while let Some(&b) = bytes.get(i) {
        if b.is_ascii_digit() {
            col = match accumulate_digit(col, b) {
                Some(value) => value,
                None => return DsrParse::NotReport,
            };
            any = true;
            i += 1;
        } else {
            break;
        }
    }
    match bytes.get(i) {
        None => DsrParse::Partial,
        Some(b'R') if any => DsrParse::Report(CursorPosition { row, col }, i + 1),
        Some(_) => DsrParse::NotReport,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_single_report() {
        let scan = extract_cursor_reports(b"\x1b[12;34R");
        assert_eq!(scan.positions, vec![CursorPosition { row: 12, col: 34 }]);
        assert!(scan.forward.is_empty());
        assert!(scan.held.is_empty());
    }

    #[test]
    fn test_report_embedded_in_input() {
        let scan = extract_cursor_reports(b"abc\x1b[1;5Rdef");
        assert_eq!(scan.positions.len(), 1);
        assert_eq!(scan.forward, b"abcdef");
    }

    #[test]
    fn test_partial_report_held_back() {
        let scan = extract_cursor_reports(b"ls\x1b[12;3");
        assert!(scan.positions.is_empty());
        assert_eq!(scan.forward, b"ls");
        assert_eq!(scan.held, b"\x1b[12;3");
    }

    #[test]
    fn test_arrow_keys_pass_through() {
        let scan = extract_cursor_reports(b"\x1b[A\x1b[D");
        assert!(scan.positions.is_empty());
        assert_eq!(scan.forward, b"\x1b[A\x1b[D");
        assert!(scan.held.is_empty());
    }

    #[test]
    fn test_multiple_reports_coalesced() {
        let scan = extract_cursor_reports(b"\x1b[1;1R\x1b[2;2R\x1b[3;3R");
        assert_eq!(scan.positions.len(), 3);
        assert_eq!(scan.positions[2], CursorPosition { row: 3, col: 3 });
    }

    #[test]
    fn test_held_prefix_completed_next_frame() {
        let first = extract_cursor_reports(b"\x1b[10;");
        assert_eq!(first.held, b"\x1b[10;");
        let mut joined = first.held.clone();
        joined.extend_from_slice(b"20Rx");
        let second = extract_cursor_reports(&joined);
        assert_eq!(second.positions, vec![CursorPosition { row: 10, col: 20 }]);
        assert_eq!(second.forward, b"x");
    }

    #[test]
    fn test_overflowing_coordinate_rejected() {
        // Digits past usize range can't be a real coordinate, even with a
        // well-formed terminator; the bytes pass through as input.
        let data = b"\x1b[99999999999999999999;1R";
        let scan = extract_cursor_reports(data);
        assert!(scan.positions.is_empty());
        assert_eq!(scan.forward, data);
        assert!(scan.held.is_empty());
    }

    #[test]
    fn test_oversized_candidate_not_held() {
        let mut data = b"\x1b[1;1".to_vec();
        data.extend_from_slice(&[b'2'; 32]);
        let scan = extract_cursor_reports(&data);
        assert!(scan.held.is_empty());
        assert_eq!(scan.forward, data);
    }

    #[tokio::test]
    async fn test_reader_to_channel_frames_and_closes() {
        let (tx, mut rx) = mpsc::channel(8);
        let data: &[u8] = b"hello";
        reader_to_channel(data, tx).await;
        assert_eq!(rx.recv().await, Some(b"hello".to_vec()));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_position_reader_demuxes() {
        let (tx, mut rx) = mpsc::channel(8);
        let (pos_tx, mut pos_rx) = mpsc::channel(128);
        let data: &[u8] = b"abc\x1b[3;7Rdef";
        reader_to_channel_with_position(data, tx, pos_tx).await;
        assert_eq!(rx.recv().await, Some(b"abcdef".to_vec()));
        assert_eq!(pos_rx.recv().await, Some(CursorPosition { row: 3, col: 7 }));
    }
}
