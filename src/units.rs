use std::fmt;

use crate::model::SpeedResult;

/// Convert megabits per second to megabytes per second.
pub fn mbps_to_mbs(mbps: f64) -> f64 {
    mbps / 8.0
}

pub fn format_speed(mbps: f64) -> String {
    format!("{:6.2} Mbps", mbps)
}

/// Render a speed in both megabits and megabytes per second.
pub fn format_speed_dual(mbps: f64) -> String {
    format!("{:6.2} Mbps | {:6.2} MB/s", mbps, mbps_to_mbs(mbps))
}

pub fn format_latency(ms: Option<f64>) -> String {
    match ms {
        Some(v) if v.is_finite() => format!("{:.0} ms", v),
        _ => "N/A".to_string(),
    }
}

pub fn format_packet_loss(percent: Option<f64>) -> String {
    match percent {
        Some(v) if v.is_finite() => format!("{:.1}%", v),
        _ => "N/A".to_string(),
    }
}

/// Coarse connection quality verdict derived from a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Ultra,
    Fast,
    Good,
    Basic,
}

impl Quality {
    pub fn label(self) -> &'static str {
        match self {
            Quality::Ultra => "ULTRA",
            Quality::Fast => "FAST",
            Quality::Good => "GOOD",
            Quality::Basic => "BASIC",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn rate(result: &SpeedResult) -> Quality {
    let dl = result.download_mbps;
    let ul = result.upload_mbps;
    let ping = result.ping_ms;
    if dl >= 500.0 && ul >= 100.0 && ping < 20.0 {
        Quality::Ultra
    } else if dl >= 200.0 && ul >= 50.0 && ping < 40.0 {
        Quality::Fast
    } else if dl >= 50.0 && ul >= 10.0 && ping < 60.0 {
        Quality::Good
    } else {
        Quality::Basic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn result(dl: f64, ul: f64, ping: f64) -> SpeedResult {
        SpeedResult {
            ping_ms: ping,
            jitter_ms: None,
            download_mbps: dl,
            upload_mbps: ul,
            packet_loss: None,
            server_name: None,
            isp: None,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn dual_format_shows_both_units() {
        assert_eq!(format_speed_dual(80.0), " 80.00 Mbps |  10.00 MB/s");
    }

    #[test]
    fn latency_formats_whole_milliseconds() {
        assert_eq!(format_latency(Some(12.4)), "12 ms");
        assert_eq!(format_latency(Some(12.6)), "13 ms");
    }

    #[test]
    fn latency_handles_missing_and_nan() {
        assert_eq!(format_latency(None), "N/A");
        assert_eq!(format_latency(Some(f64::NAN)), "N/A");
    }

    #[test]
    fn packet_loss_formats_one_decimal() {
        assert_eq!(format_packet_loss(Some(0.0)), "0.0%");
        assert_eq!(format_packet_loss(Some(2.34)), "2.3%");
        assert_eq!(format_packet_loss(None), "N/A");
    }

    #[test]
    fn quality_tiers_follow_thresholds() {
        assert_eq!(rate(&result(600.0, 120.0, 10.0)), Quality::Ultra);
        assert_eq!(rate(&result(250.0, 60.0, 30.0)), Quality::Fast);
        assert_eq!(rate(&result(60.0, 15.0, 50.0)), Quality::Good);
        assert_eq!(rate(&result(10.0, 2.0, 80.0)), Quality::Basic);
    }

    #[test]
    fn quality_requires_all_three_thresholds() {
        // Download alone does not reach a tier when ping is too high.
        assert_eq!(rate(&result(600.0, 120.0, 25.0)), Quality::Fast);
        assert_eq!(rate(&result(600.0, 5.0, 10.0)), Quality::Basic);
    }
}
