//! Per-array command batches

use crate::{codec::encode_frame, Markers, ProtocolError, Result};

/// Separator between per-array commands in one operator line
pub const COMMAND_SEPARATOR: char = ';';

/// Commands dispatched together in one round, one per array
///
/// Position `i` goes to the array on channel `i`; there is no separate id map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBatch {
    commands: Vec<String>,
}

impl CommandBatch {
    /// Create a batch from already-encoded command strings
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    /// Parse an operator line into a batch for `arrays` arrays
    ///
    /// The line is split on `;`, every segment must be a plain decimal number,
    /// and each one is wrapped between the markers, so `"3;5"` becomes
    /// `["<3>", "<5>"]`.
    pub fn parse(line: &str, arrays: usize, markers: &Markers) -> Result<Self> {
        let commands = line
            .trim()
            .split(COMMAND_SEPARATOR)
            .map(str::trim)
            .enumerate()
            .map(|(index, segment)| {
                if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ProtocolError::InvalidCommand {
                        index,
                        segment: segment.to_string(),
                    });
                }
                encode_frame(markers, segment)
            })
            .collect::<Result<Vec<_>>>()?;

        let batch = Self::new(commands);
        batch.ensure_len(arrays)?;
        Ok(batch)
    }

    /// Check the batch lines up with `expected` channels
    pub fn ensure_len(&self, expected: usize) -> Result<()> {
        if self.commands.len() != expected {
            return Err(ProtocolError::BatchSizeMismatch {
                expected,
                actual: self.commands.len(),
            });
        }
        Ok(())
    }

    /// Number of commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the batch holds no commands
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Command for the array at `index`
    pub fn get(&self, index: usize) -> Option<&str> {
        self.commands.get(index).map(String::as_str)
    }

    /// Iterate over commands in channel order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for CommandBatch {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}
