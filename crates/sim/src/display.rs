//! Terminal rendering of snapshots and link statistics

use colored::{ColoredString, Colorize};
use dtd_radio::{LinkStats, TargetState, TargetStatus};

/// Padded to a fixed width before colouring so columns line up.
pub fn state_label(state: TargetState) -> ColoredString {
    match state {
        TargetState::Present => format!("{:<8}", "PRESENT").green().bold(),
        TargetState::Absent => format!("{:<8}", "ABSENT").red().bold(),
        TargetState::Unknown => format!("{:<8}", "UNKNOWN").bright_black(),
    }
}

pub fn status_line(status: &TargetStatus) -> String {
    let battery = status
        .battery
        .map(|b| format!("{:>3}%", b))
        .unwrap_or_else(|| "  --".to_string());
    let signal = status
        .signal
        .map(|s| format!("{:>4} dBm", s))
        .unwrap_or_else(|| "   -- dBm".to_string());

    let mut line = format!(
        "  unit {:>2}  {}  bat {}  sig {}",
        status.address,
        state_label(status.state),
        battery,
        signal
    );
    if status.flags.low_battery() {
        line.push_str(&format!("  {}", "LOW BATTERY".yellow()));
    }
    if status.flags.fault() {
        line.push_str(&format!("  {}", "FAULT".bright_red()));
    }
    line
}

pub fn print_snapshot(cycle: u64, snapshot: &[TargetStatus]) {
    let known = snapshot.iter().filter(|s| s.is_known()).count();
    println!(
        "{}",
        format!("cycle {} ({}/{} answered)", cycle, known, snapshot.len()).bright_blue()
    );
    for status in snapshot {
        println!("{}", status_line(status));
    }
}

pub fn print_stats(stats: &LinkStats) {
    let rate = stats.success_rate();
    let line = format!("[stats] {}", stats);
    if rate >= 90.0 {
        println!("{}", line.bright_green());
    } else if rate >= 60.0 {
        println!("{}", line.bright_yellow());
    } else {
        println!("{}", line.bright_red());
    }
}
