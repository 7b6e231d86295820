/// Least-squares slope of `y` over `x`. `None` when the fit is degenerate
/// (fewer than two points or no spread in `x`).
pub(crate) fn least_squares_slope(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let (x, y) = (&x[..n], &y[..n]);
    let mean_x = x.iter().sum::<f64>() / n as f64;
    let mean_y = y.iter().sum::<f64>() / n as f64;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        sxx += dx * dx;
        sxy += dx * (yi - mean_y);
    }
    if sxx <= f64::EPSILON || !sxy.is_finite() {
        return None;
    }
    Some(sxy / sxx)
}
