use std::time::{Duration, Instant};

/// Do approximately `duration` of CPU work.
#[inline(never)]
pub fn do_cpu_work(duration: Duration) {
    let start = Instant::now();
    let mut acc: u64 = 0;
    while start.elapsed() < duration {
        for _ in 0..1000 {
            acc = acc.wrapping_mul(6364136223846793005).wrapping_add(1);
        }
        std::hint::black_box(acc);
    }
}

/// Generate exponentially distributed inter-arrival time.
/// For a Poisson process with rate λ, inter-arrival times are Exp(λ);
/// mean inter-arrival time = 1/λ.
pub fn exponential_delay(rng: &mut impl rand::Rng, mean: Duration) -> Duration {
    let u: f64 = rng.gen(); // uniform [0, 1)
    let u = u.max(f64::EPSILON);
    Duration::from_secs_f64(mean.as_secs_f64() * -u.ln())
}

/// Latency sample sink with quantile readout.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    samples: Vec<Duration>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency: Duration) {
        self.samples.push(latency);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn quantile(&self, q: f64) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted = self.samples.clone();
        sorted.sort();
        let idx = ((q / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn mean(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let sum: Duration = self.samples.iter().sum();
        sum / self.samples.len() as u32
    }
}
