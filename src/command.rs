use std::fmt;

use crate::error::ChainError;

/// A single line understood by a plugin host on its control input.
///
/// The rendering follows the interactive console of the common LV2 hosts:
/// `preset <uri>`, `set <symbol> <value>` and `controls` to dump the current
/// control values into the host's log. Plugin state properties go out as
/// `patch_set <key> <value>` and the bypass switch as `bypass 0|1`.
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    LoadPreset(String),
    PatchSet { key: String, value: String },
    SetParam { symbol: String, value: f64 },
    Bypass(bool),
    DumpState,
    Raw(String),
}

impl HostCommand {
    /// Render the command as one line, without the trailing newline.
    pub fn render(&self) -> Result<String, ChainError> {
        let line = match self {
            HostCommand::LoadPreset(uri) => {
                require_token("preset uri", uri)?;
                format!("preset {uri}")
            }
            HostCommand::PatchSet { key, value } => {
                require_token("state key", key)?;
                let value = value.trim();
                if value.is_empty() {
                    return Err(ChainError::InvalidCommand(format!("state `{key}` has an empty value")));
                }
                format!("patch_set {key} {value}")
            }
            HostCommand::Bypass(on) => format!("bypass {}", u8::from(*on)),
            HostCommand::SetParam { symbol, value } => {
                require_token("parameter symbol", symbol)?;
                if !value.is_finite() {
                    return Err(ChainError::InvalidCommand(format!(
                        "value for `{symbol}` must be finite, got {value}"
                    )));
                }
                format!("set {symbol} {value}")
            }
            HostCommand::DumpState => "controls".to_string(),
            HostCommand::Raw(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(ChainError::InvalidCommand("empty command".into()));
                }
                text.to_string()
            }
        };
        if line.contains(['\n', '\r']) {
            return Err(ChainError::InvalidCommand(format!(
                "`{}` spans more than one line",
                line.escape_debug()
            )));
        }
        Ok(line)
    }
}

fn require_token(what: &str, value: &str) -> Result<(), ChainError> {
    if value.is_empty() || value.chars().any(char::is_whitespace) {
        return Err(ChainError::InvalidCommand(format!(
            "{what} `{}` must be a single non-empty word",
            value.escape_debug()
        )));
    }
    Ok(())
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Ok(line) => f.write_str(&line),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}
