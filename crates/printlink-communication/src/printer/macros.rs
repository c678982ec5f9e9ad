//! Printer macro placeholders
//!
//! Pause, resume and cancel snippets may contain placeholder lines that are
//! replaced with G-code built from the current motion state. Expansion only
//! reads that state, so expanding the same line twice gives the same text.

use super::transforms::MotionTracker;

/// Return the head to the last commanded X/Y/Z at the last feed rate
pub const RESTORE_XYZ_POSITION: &str = "@RESTORE_XYZ_POSITION";
/// Reset the extruder position to the last commanded E
pub const RESTORE_E_POSITION: &str = "@RESTORE_E_POSITION";

/// Expand a trimmed, uppercased line if it is a known placeholder
pub fn expand_printer_macro(line: &str, motion: &MotionTracker) -> String {
    match line {
        RESTORE_XYZ_POSITION => motion.restore_position_line(),
        RESTORE_E_POSITION => format!("G92 E{:.5}", motion.extruder_destination()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_placeholders() {
        let mut motion = MotionTracker::new();
        motion.track_destination("G1 X1 Y2 Z3 E4.25 F600");

        assert_eq!(
            expand_printer_macro(RESTORE_XYZ_POSITION, &motion),
            "G0 X1.000 Y2.000 Z3.000 F600"
        );
        assert_eq!(
            expand_printer_macro(RESTORE_E_POSITION, &motion),
            "G92 E4.25000"
        );
        assert_eq!(expand_printer_macro("G28", &motion), "G28");
    }

    #[test]
    fn test_expansion_is_stable() {
        let mut motion = MotionTracker::new();
        motion.track_destination("G1 X5 F100");
        let once = expand_printer_macro(RESTORE_XYZ_POSITION, &motion);
        let twice = expand_printer_macro(RESTORE_XYZ_POSITION, &motion);
        assert_eq!(once, twice);
        assert_eq!(expand_printer_macro(&once, &motion), once);
    }
}
