//! Boundary to whatever turns a captured ViewState into plaintext bytes.
//!
//! Keys, algorithms and MAC validation live in the external tool; this crate
//! only sees the result.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::debug;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecryptError {
    /// The upstream tool rejected the payload (MAC mismatch, bad structure).
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("decryption tool failed: {0}")]
    Tool(#[from] std::io::Error),
}

pub trait ViewStateDecryptor: Sync {
    fn decrypt(&self, viewstate_b64: &str) -> Result<Vec<u8>, DecryptError>;
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, DecryptError> {
    let cleaned: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(BASE64.decode(cleaned.as_bytes())?)
}

/// For ViewStates that were never encrypted, or were decrypted elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecodedPayload;

impl ViewStateDecryptor for DecodedPayload {
    fn decrypt(&self, viewstate_b64: &str) -> Result<Vec<u8>, DecryptError> {
        decode_base64(viewstate_b64)
    }
}

/// Runs an external decryption tool once per ViewState.
///
/// The ViewState is written to the tool's stdin; the tool must print the
/// base64 of the decrypted bytes on stdout and exit non-zero on failure.
#[derive(Debug, Clone)]
pub struct CommandDecryptor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandDecryptor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        CommandDecryptor {
            program: program.into(),
            args,
        }
    }
}

impl ViewStateDecryptor for CommandDecryptor {
    fn decrypt(&self, viewstate_b64: &str) -> Result<Vec<u8>, DecryptError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Fed from a separate thread so a tool that streams output before
        // draining stdin cannot deadlock on a full pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let input = viewstate_b64.trim().to_string();
            std::thread::spawn(move || stdin.write_all(input.as_bytes()))
        });
        let output = child.wait_with_output()?;
        if let Some(handle) = writer {
            if let Ok(Err(e)) = handle.join() {
                // The tool may legitimately stop reading early.
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(DecryptError::Tool(e));
                }
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!("{} exited with {}: {}", self.program.display(), output.status, stderr);
            let reason = if stderr.is_empty() {
                format!("decryption tool exited with {}", output.status)
            } else {
                stderr
            };
            return Err(DecryptError::InvalidPayload(reason));
        }

        decode_base64(&String::from_utf8_lossy(&output.stdout))
    }
}
