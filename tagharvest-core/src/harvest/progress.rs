use std::time::Duration;

/// Render an elapsed duration the way progress lines show it:
/// `07s`, `05m:07s`, `02h:05m:07s`, `1d:02h:05m:07s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{days}d:{hours:02}h:{minutes:02}m:{seconds:02}s")
    } else if hours > 0 {
        format!("{hours:02}h:{minutes:02}m:{seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes:02}m:{seconds:02}s")
    } else {
        format!("{seconds:02}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_largest_unit() {
        assert_eq!(format_elapsed(Duration::from_millis(900)), "00s");
        assert_eq!(format_elapsed(Duration::from_secs(7)), "07s");
        assert_eq!(format_elapsed(Duration::from_secs(5 * 60 + 7)), "05m:07s");
        assert_eq!(format_elapsed(Duration::from_secs(2 * 3_600 + 5 * 60 + 7)), "02h:05m:07s");
        assert_eq!(
            format_elapsed(Duration::from_secs(86_400 + 2 * 3_600 + 5 * 60 + 7)),
            "1d:02h:05m:07s"
        );
    }
}
