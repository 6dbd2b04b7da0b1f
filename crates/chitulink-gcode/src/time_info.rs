// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print-time metacommands. The slicer's `;TIME:` and `;TIME_ELAPSED:`
// comments become `M2100` / `M2101` so the device can show total and
// elapsed print time.

const TOTAL_TIME: &str = ";TIME:";
const ELAPSED_TIME: &str = ";TIME_ELAPSED:";

/// Rewrite time comments. The text is split on `\n` only, so `\r` bytes are
/// kept, and every segment (including the empty one after a final newline)
/// is written back newline-terminated.
pub fn insert_time_infos(gcode: &str) -> String {
    let mut out = String::with_capacity(gcode.len() + 64);
    for line in gcode.split('\n') {
        if let Some(rest) = line.strip_prefix(TOTAL_TIME) {
            out.push_str(&format!("M2100 T{}\n", leading_number(rest)));
        } else if let Some(rest) = line.strip_prefix(ELAPSED_TIME) {
            out.push_str(&format!("M2101 T{}\n", leading_number(rest)));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Integer part of the number at the start of `text`, or 0.
fn leading_number(text: &str) -> i64 {
    let bytes = text.as_bytes();
    let mut end = usize::from(bytes.first() == Some(&b'-'));
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return 0;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    text[..end].parse::<f64>().map(|v| v.trunc() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_time_comments() {
        let gcode = ";FLAVOR:Marlin\n;TIME:6163\nG28\n;TIME_ELAPSED:12.84\nG1 X10\n";
        assert_eq!(
            insert_time_infos(gcode),
            ";FLAVOR:Marlin\nM2100 T6163\nG28\nM2101 T12\nG1 X10\n\n"
        );
    }

    #[test]
    fn unparseable_time_is_zero() {
        assert_eq!(insert_time_infos(";TIME:abc"), "M2100 T0\n");
        assert_eq!(insert_time_infos(";TIME_ELAPSED:"), "M2101 T0\n");
    }

    #[test]
    fn last_line_gets_newline() {
        assert_eq!(insert_time_infos("G28\nM84"), "G28\nM84\n");
    }

    #[test]
    fn crlf_bytes_are_preserved() {
        assert_eq!(
            insert_time_infos("G28\r\n;TIME:90\r\nM84\r\n"),
            "G28\r\nM2100 T90\nM84\r\n\n"
        );
    }

    #[test]
    fn leading_number_forms() {
        assert_eq!(leading_number("42"), 42);
        assert_eq!(leading_number("-3.9x"), -3);
        assert_eq!(leading_number("7. trailing"), 7);
        assert_eq!(leading_number("-"), 0);
    }
}
