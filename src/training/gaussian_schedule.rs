/// Mixture-component growth curve for one stage.
///
/// `target = max_gaussians * (iteration / num_iterations)^power`, never below
/// the current count and never above `max_gaussians`. Powers below 1 add most
/// components early.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianSchedule {
    num_iterations: u32,
    max_gaussians: usize,
    power: f64,
}

impl GaussianSchedule {
    pub fn new(num_iterations: u32, max_gaussians: usize, power: f64) -> Self {
        Self {
            num_iterations: num_iterations.max(1),
            max_gaussians,
            power,
        }
    }

    pub fn max_gaussians(&self) -> usize {
        self.max_gaussians
    }

    /// Target count after growth in 1-based `iteration`.
    pub fn target(&self, iteration: u32, current: usize) -> usize {
        if iteration >= self.num_iterations {
            return self.max_gaussians;
        }
        let fraction = f64::from(iteration) / f64::from(self.num_iterations);
        let curve = (self.max_gaussians as f64 * fraction.powf(self.power)).round() as usize;
        curve.max(current).min(self.max_gaussians)
    }

    /// Targets for every iteration, starting from `initial` components.
    pub fn targets(&self, initial: usize) -> Vec<usize> {
        let mut current = initial;
        (1..=self.num_iterations)
            .map(|it| {
                current = self.target(it, current);
                current
            })
            .collect()
    }
}

/// Free-standing form of [`GaussianSchedule::target`].
pub fn target_gaussians(
    iteration: u32,
    num_iterations: u32,
    current: usize,
    max_gaussians: usize,
    power: f64,
) -> usize {
    GaussianSchedule::new(num_iterations, max_gaussians, power).target(iteration, current)
}
