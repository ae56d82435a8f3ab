use nalgebra::DVector;

/// Plain SGD with L2 weight decay: `x += lr * (g - reg * x)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegularizedSgd {
    learning_rate: f64,
    regularization: f64,
}

impl RegularizedSgd {
    pub fn new(learning_rate: f64, regularization: f64) -> Self {
        Self {
            learning_rate,
            regularization,
        }
    }

    pub fn step_scalar(&self, param: &mut f64, gradient: f64) {
        *param += self.learning_rate * (gradient - self.regularization * *param);
    }

    /// Delta for a vector parameter without applying it.
    pub fn delta(&self, param: &DVector<f64>, gradient: &DVector<f64>) -> DVector<f64> {
        (gradient - param * self.regularization) * self.learning_rate
    }
}
