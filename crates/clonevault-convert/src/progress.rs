//! Progress tracking for conversion

use clonevault_core::format_size;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Progress information during conversion
#[derive(Debug, Clone)]
pub struct ConvertProgress {
    /// Source blocks in the image
    pub blocks_total: u32,
    /// Source blocks examined so far
    pub blocks_visited: u32,
    /// Bytes shared into the destination so far
    pub bytes_cloned: u64,
    /// Time elapsed since start
    pub elapsed: Duration,
    /// Percentage complete (0.0 - 100.0)
    pub percent_complete: f64,
    /// Current operation description
    pub operation: String,
}

impl ConvertProgress {
    /// Calculate progress from current state
    pub fn calculate(
        blocks_total: u32,
        blocks_visited: u32,
        bytes_cloned: u64,
        start_time: Instant,
        operation: &str,
    ) -> Self {
        let percent_complete = if blocks_total > 0 {
            (blocks_visited as f64 / blocks_total as f64) * 100.0
        } else {
            100.0
        };

        Self {
            blocks_total,
            blocks_visited,
            bytes_cloned,
            elapsed: start_time.elapsed(),
            percent_complete,
            operation: operation.to_string(),
        }
    }

    /// Format progress as human-readable string
    pub fn format(&self) -> String {
        format!(
            "{}: {:.1}% complete - block {} of {} - {} cloned - {}",
            self.operation,
            self.percent_complete,
            self.blocks_visited,
            self.blocks_total,
            format_size(self.bytes_cloned),
            format_duration(self.elapsed)
        )
    }
}

/// Callback type for progress updates
pub type ProgressCallback = Arc<dyn Fn(&ConvertProgress) + Send + Sync>;

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs >= 3600 {
        let hours = total_secs / 3600;
        let mins = (total_secs % 3600) / 60;
        format!("{}h {}m", hours, mins)
    } else if total_secs >= 60 {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        format!("{}m {}s", mins, secs)
    } else if total_secs > 0 {
        format!("{}s", total_secs)
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m");
    }

    #[test]
    fn test_progress_calculation() {
        let progress = ConvertProgress::calculate(8, 2, 4096, Instant::now(), "Cloning");
        assert!((progress.percent_complete - 25.0).abs() < 0.1);
        assert!(progress.format().starts_with("Cloning: 25.0% complete - block 2 of 8"));
    }

    #[test]
    fn test_progress_empty_image_is_complete() {
        let progress = ConvertProgress::calculate(0, 0, 0, Instant::now(), "Cloning");
        assert_eq!(progress.percent_complete, 100.0);
    }
}
