// Child shell on a pseudoterminal. A blocking reader thread forwards PTY
// output frames into a tokio channel; the master handle stays here for
// resizes and teardown.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

const READ_BUF_SIZE: usize = 4096;

pub struct PtyShell {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl PtyShell {
    /// Spawn `shell_binary` on a new PTY. Output frames land on `out_tx`;
    /// the returned writer is the child's stdin.
    pub fn spawn(
        shell_binary: &str,
        cols: u16,
        rows: u16,
        extra_env: &[(&str, &str)],
        out_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<(Self, Box<dyn Write + Send>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let mut cmd = CommandBuilder::new(shell_binary);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in extra_env {
            cmd.env(key, value);
        }
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("failed to spawn child shell")?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair
            .master
            .take_writer()
            .context("failed to take pty writer")?;

        // Channel closure on either side ends the thread; EOF means the
        // shell exited.
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok((
            Self {
                master: pair.master,
                child,
            },
            writer,
        ))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to resize pty")
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        // Make the reader thread hit EOF and exit; it is detached so we
        // never block shutdown on a stuck read.
        let _ = self.child.kill();
    }
}
