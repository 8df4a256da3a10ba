use rand::Rng;

/// Loss and latency applied to envelopes delivered over one relay link.
#[derive(Debug, Clone, Default)]
pub struct LinkSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl LinkSimulation {
    pub fn latency(min_latency_ms: u32, max_latency_ms: u32) -> Self {
        Self {
            enabled: true,
            min_latency_ms,
            max_latency_ms,
            ..Self::default()
        }
    }

    pub fn lossy(loss_percent: f32) -> Self {
        Self {
            enabled: true,
            loss_percent,
            ..Self::default()
        }
    }

    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        let chance = (self.loss_percent as f64 / 100.0).min(1.0);
        rand::rng().random_bool(chance)
    }

    /// Uniform latency in `min..=max` plus up to `jitter_ms` of extra spread.
    pub fn delay_ms(&self) -> u32 {
        if !self.enabled || self.max_latency_ms == 0 {
            return 0;
        }
        let mut rng = rand::rng();
        let floor = self.min_latency_ms.min(self.max_latency_ms);
        rng.random_range(floor..=self.max_latency_ms) + rng.random_range(0..=self.jitter_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub envelopes_sent: u64,
    pub envelopes_received: u64,
    pub envelopes_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}
