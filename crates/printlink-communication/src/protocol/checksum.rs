//! Line-number and checksum framing
//!
//! Firmware validates `N<seq> <gcode>*<checksum>` where the checksum is the
//! XOR of every byte before the `*`.

/// XOR of all bytes of `text`
pub fn checksum(text: &str) -> u8 {
    text.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Frame a line as `N<seq> <line>*<checksum>`
pub fn frame_line(sequence: usize, line: &str) -> String {
    let numbered = format!("N{} {}", sequence, line);
    let cs = checksum(&numbered);
    format!("{}*{}", numbered, cs)
}

/// Split a framed line into its numbered prefix and transmitted checksum
pub fn split_frame(framed: &str) -> Option<(&str, u8)> {
    let (prefix, cs) = framed.rsplit_once('*')?;
    Some((prefix, cs.trim().parse().ok()?))
}
