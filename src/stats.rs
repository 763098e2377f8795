use std::net::Ipv4Addr;
use std::time::Duration;

use crate::pinger::Outcome;
use crate::utils::duration_millis;

/// Running counters for one ping run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingStatistics {
    total_count: u64,
    success_count: u64,
    rtts: Vec<Duration>,
}

/// Round-trip summary in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RttSummary {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    pub stddev: f64,
}

impl PingStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, rtt: Duration) {
        self.total_count += 1;
        self.success_count += 1;
        self.rtts.push(rtt);
    }

    pub fn record_timeout(&mut self) {
        self.total_count += 1;
    }

    pub fn transmitted(&self) -> u64 {
        self.total_count
    }

    pub fn received(&self) -> u64 {
        self.success_count
    }

    pub fn timeouts(&self) -> u64 {
        self.total_count - self.success_count
    }

    pub fn rtts(&self) -> &[Duration] {
        &self.rtts
    }

    /// Percentage of attempts without a reply. A run with no attempts has
    /// lost nothing and reports 0.
    pub fn packet_loss(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        (1.0 - self.success_count as f64 / self.total_count as f64) * 100.0
    }

    /// min/avg/max/stddev over every recorded round trip, all zero when
    /// nothing was received. The deviation is the population one.
    pub fn rtt_summary(&self) -> RttSummary {
        let millis: Vec<f64> = self.rtts.iter().copied().map(duration_millis).collect();

        RttSummary {
            min: min(&millis),
            avg: mean(&millis),
            max: max(&millis),
            stddev: std_dev(&millis),
        }
    }

    pub fn format_summary(&self, target: &str) -> String {
        let rtt = self.rtt_summary();

        format!(
            "\n--- {} ping statistics ---\n\
             {} packets transmitted, {} packets received, {:.1}% packet loss\n\
             round-trip min/avg/max/stddev = {:.3}/{:.3}/{:.3}/{:.3} ms",
            target,
            self.transmitted(),
            self.received(),
            self.packet_loss(),
            rtt.min,
            rtt.avg,
            rtt.max,
            rtt.stddev
        )
    }
}

pub fn format_header(target: Ipv4Addr, packet_size: usize) -> String {
    format!("PING {}: {} data bytes", target, packet_size)
}

pub fn format_outcome(outcome: &Outcome, source: Ipv4Addr) -> String {
    if outcome.timeout {
        format!("Request timeout for icmp_seq {}", outcome.sequence)
    } else {
        format!(
            "{} bytes from {}: icmp_seq={} time={:.3} ms",
            outcome.size,
            source,
            outcome.sequence,
            duration_millis(outcome.rtt)
        )
    }
}

pub fn min(population: &[f64]) -> f64 {
    population.iter().copied().reduce(f64::min).unwrap_or(0.0)
}

pub fn max(population: &[f64]) -> f64 {
    population.iter().copied().reduce(f64::max).unwrap_or(0.0)
}

pub fn mean(population: &[f64]) -> f64 {
    if population.is_empty() {
        return 0.0;
    }
    population.iter().sum::<f64>() / population.len() as f64
}

pub fn std_dev(population: &[f64]) -> f64 {
    if population.is_empty() {
        return 0.0;
    }
    let mean = mean(population);
    let sum_dist: f64 = population.iter().map(|v| (v - mean).powi(2)).sum();
    (sum_dist / population.len() as f64).sqrt()
}
