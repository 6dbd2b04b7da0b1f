// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Terminal rendering for status and progress.

use chitulink_core::human_errors::HumanError;
use chitulink_core::types::{PrintState, PrinterStatus, Temperature};

const BAR_WIDTH: usize = 30;

/// `1h 02m 03s`, `4m 05s` or `9s`.
pub fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, seconds / 60 % 60, seconds % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

pub fn progress_bar(percent: u8) -> String {
    let percent = percent.min(100);
    let filled = BAR_WIDTH * usize::from(percent) / 100;
    format!(
        "[{}{}] {percent:>3}%",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled)
    )
}

fn temperature(label: &str, temp: Option<Temperature>) -> Option<String> {
    temp.map(|t| format!("{label} {:.0}/{:.0}°C", t.current, t.target))
}

/// One line summarising the printer's state.
pub fn status_line(status: &PrinterStatus, remaining: Option<u64>) -> String {
    let state = match status.state() {
        PrintState::Idle => "idle",
        PrintState::Printing => "printing",
        PrintState::Paused => "paused",
    };
    let mut parts = vec![state.to_string()];

    if status.is_printing {
        if !status.active_file.is_empty() {
            parts.push(status.active_file.clone());
        }
        if let Some(fraction) = status.progress_fraction() {
            parts.push(format!("{:.1}%", fraction * 100.0));
        }
        parts.push(format!("elapsed {}", format_duration(status.elapsed_seconds)));
        if let Some(left) = remaining {
            parts.push(format!("left {}", format_duration(left)));
        }
    }

    parts.extend(temperature("bed", status.bed));
    parts.extend(temperature("E1", status.extruder1));
    parts.extend(temperature("E2", status.extruder2));
    if let Some(fan) = status.fan_percent() {
        parts.push(format!("fan {fan}%"));
    }
    if let Some(z) = &status.z_position {
        parts.push(format!("Z {z}"));
    }
    parts.join(" | ")
}

pub fn error_report(err: &HumanError) -> String {
    if err.suggestion.is_empty() {
        format!("error: {}", err.message)
    } else {
        format!("error: {}\n  {}", err.message, err.suggestion)
    }
}
