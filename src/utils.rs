
use serde::Serialize;

// Perform a 1-D least squares linear fit, used to report resistance drift over a run

#[derive(Default)]
pub struct LinearFitProblem {
    pub points: Vec<(f64, f64)>
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl LinearFit {
    pub fn at(&self, x: f64) -> f64 { self.slope*x + self.intercept }
}

impl LinearFitProblem {

    pub fn new<I: IntoIterator<Item=(f64, f64)>>(points: I) -> Self {
        Self { points: points.into_iter().collect() }
    }

    // None when fewer than two distinct x values are present
    pub fn solve(&self) -> Option<LinearFit> {
        let n = self.points.len() as f64;
        let xx: f64 = self.points.iter().map(|(x, _)| *x * *x).sum();
        let xy: f64 = self.points.iter().map(|(x, y)| *x * *y).sum();
        let x: f64 = self.points.iter().map(|(x, _)| *x).sum();
        let y: f64 = self.points.iter().map(|(_, y)| *y).sum();

        let denom: f64 = n*xx - x.powi(2);
        if self.points.len() < 2 || denom == 0.0 {
            return None;
        }

        let det: f64 = 1.0 / denom;
        let slope     = det*( n*xy - x*y);
        let intercept = det*(-x*xy + y*xx);

        let mean_y = y / n;
        let ss_tot: f64 = self.points.iter().map(|(_, yi)| (yi - mean_y).powi(2)).sum();
        let ss_res: f64 = self.points.iter().map(|(xi, yi)| (yi - (slope*xi + intercept)).powi(2)).sum();
        let r_squared = if ss_tot == 0.0 { 1.0 } else { 1.0 - ss_res / ss_tot };

        Some(LinearFit { slope, intercept, r_squared })
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_line() {
        let fit = LinearFitProblem::new(vec![(0.0, 1.0), (1.0, 3.0), (2.0, 5.0)]).solve().unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!((fit.r_squared - 1.0).abs() < 1e-12);
        assert!((fit.at(4.0) - 9.0).abs() < 1e-12);
    }

    #[test]
    fn singular_problems() {
        assert!(LinearFitProblem::default().solve().is_none());
        assert!(LinearFitProblem::new(vec![(1.0, 1.0)]).solve().is_none());
        assert!(LinearFitProblem::new(vec![(1.0, 1.0), (1.0, 2.0)]).solve().is_none());
    }

    #[test]
    fn flat_data_fits_perfectly() {
        let fit = LinearFitProblem::new(vec![(0.0, 7.0), (1.0, 7.0), (2.0, 7.0)]).solve().unwrap();
        assert!(fit.slope.abs() < 1e-12);
        assert_eq!(fit.r_squared, 1.0);
    }
}
