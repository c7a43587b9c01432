/// Linear warmup from zero to `base_lr`, then optional linear decay to zero.
///
/// Advanced once per optimizer step, so the rate used by step `n` is
/// `lr_at(n)`.
#[derive(Debug, Clone)]
pub struct LinearWarmup {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: Option<usize>,
    step: usize,
}

impl LinearWarmup {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: Option<usize>) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            step: 0,
        }
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        match self.total_steps {
            Some(total) => {
                let remaining = total.saturating_sub(step) as f64;
                let span = total.saturating_sub(self.warmup_steps).max(1) as f64;
                self.base_lr * remaining / span
            }
            None => self.base_lr,
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.step)
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    /// Moves to the next step and returns its learning rate.
    pub fn step(&mut self) -> f64 {
        self.step += 1;
        self.current_lr()
    }
}
