use netshaper_common::pct_to_prob;
use rand::Rng;

/// A uniform `[0, 1)` source whose draws can be correlated with the previous one, the way
/// netem correlates its random numbers: `next = (1 - rho) * U + rho * last`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Correlated {
    rho: f64,
    last: Option<f64>,
}

impl Correlated {
    /// `correlation` is a percentage.
    pub(crate) fn new(correlation: f64) -> Self {
        Self { rho: pct_to_prob(correlation), last: None }
    }

    pub(crate) fn next<R: Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        let u: f64 = rng.gen();
        let value = match self.last {
            Some(last) if self.rho > 0.0 => (1.0 - self.rho) * u + self.rho * last,
            _ => u,
        };
        self.last = Some(value);
        value
    }

    /// True when the next draw does not depend on earlier ones.
    pub(crate) fn is_memoryless(&self) -> bool {
        self.rho == 0.0 || self.last.is_none()
    }

    /// Draws and compares against a percentage.
    pub(crate) fn chance<R: Rng + ?Sized>(&mut self, rng: &mut R, percentage: f64) -> bool {
        percentage > 0.0 && self.next(rng) < pct_to_prob(percentage)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn uncorrelated_matches_plain_draws() {
        let mut a = StdRng::seed_from_u64(1);
        let mut b = StdRng::seed_from_u64(1);
        let mut src = Correlated::new(0.0);

        for _ in 0..100 {
            assert_eq!(src.next(&mut a), b.gen::<f64>());
        }
    }

    #[test]
    fn full_correlation_repeats_first_draw() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut src = Correlated::new(100.0);

        let first = src.next(&mut rng);
        for _ in 0..10 {
            assert_eq!(src.next(&mut rng), first);
        }
    }

    #[test]
    fn zero_percent_never_fires() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut src = Correlated::new(50.0);
        assert!((0..1000).all(|_| !src.chance(&mut rng, 0.0)));
        assert!((0..1000).all(|_| src.chance(&mut rng, 100.0)));
    }
}
