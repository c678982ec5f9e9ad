//! Named setting lookup.
//!
//! The engine reads its G-code snippets (connect, pause, resume, cancel)
//! through [`SettingsSource`] so it does not depend on how settings are
//! stored.

use std::collections::HashMap;

/// Well-known setting names
pub mod keys {
    /// G-code sent once the handshake succeeds
    pub const CONNECT_GCODE: &str = "connect_gcode";
    /// G-code injected when a print pauses
    pub const PAUSE_GCODE: &str = "pause_gcode";
    /// G-code injected before a paused print continues
    pub const RESUME_GCODE: &str = "resume_gcode";
    /// G-code injected when a print is canceled
    pub const CANCEL_GCODE: &str = "cancel_gcode";
}

/// Read-only view of named settings
pub trait SettingsSource: Send + Sync {
    /// Raw value of a setting, `None` when unset
    fn value(&self, key: &str) -> Option<String>;

    /// Substitute `[name]` placeholders in a G-code snippet
    fn replace_macro_values(&self, gcode: &str) -> String {
        gcode.to_string()
    }

    /// Value of a setting, empty when unset
    fn value_or_empty(&self, key: &str) -> String {
        self.value(key).unwrap_or_default()
    }
}

impl SettingsSource for HashMap<String, String> {
    fn value(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }

    fn replace_macro_values(&self, gcode: &str) -> String {
        replace_bracketed(gcode, |name| self.get(name).cloned())
    }
}

/// Replace every `[name]` for which `lookup` has a value
pub fn replace_bracketed(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(']') {
            Some(close) => {
                let name = &after[..close];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('[');
                        out.push_str(name);
                        out.push(']');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(keys::CANCEL_GCODE.to_string(), "M104 S0".to_string());
        map.insert("temperature".to_string(), "205".to_string());
        map
    }

    #[test]
    fn test_value_lookup() {
        let s = settings();
        assert_eq!(s.value(keys::CANCEL_GCODE).as_deref(), Some("M104 S0"));
        assert_eq!(s.value_or_empty(keys::PAUSE_GCODE), "");
    }

    #[test]
    fn test_placeholders_are_replaced() {
        let s = settings();
        assert_eq!(s.replace_macro_values("M109 S[temperature]"), "M109 S205");
        assert_eq!(s.replace_macro_values("M140 S[bed]"), "M140 S[bed]");
        assert_eq!(s.replace_macro_values("G1 [X"), "G1 [X");
    }
}
