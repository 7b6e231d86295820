/// Local maxima of `x` whose prominence is at least `min_prominence`.
///
/// Flat peaks report the middle sample (rounded down). Interior peaks need a
/// strictly lower sample on both sides. With `trailing_edge` the final sample
/// is also a candidate when it rises above its predecessor; its prominence is
/// measured against the left valley only since nothing follows it yet.
pub(crate) fn prominent_peaks(x: &[f64], min_prominence: f64, trailing_edge: bool) -> Vec<usize> {
    let mut peaks: Vec<usize> = local_maxima(x)
        .into_iter()
        .filter(|&peak| prominence(x, peak) >= min_prominence)
        .collect();
    if trailing_edge {
        if let Some(peak) = trailing_candidate(x) {
            if left_prominence(x, peak) >= min_prominence {
                peaks.push(peak);
            }
        }
    }
    peaks
}

fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }
    let last = x.len() - 1;
    let mut i = 1;
    while i < last {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < last && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

fn trailing_candidate(x: &[f64]) -> Option<usize> {
    let last = x.len().checked_sub(1)?;
    let top = x[last];
    let before = x[..last].iter().rev().find(|&&value| value != top)?;
    (*before < top).then_some(last)
}

fn left_base(x: &[f64], peak: usize) -> f64 {
    let height = x[peak];
    let mut base = height;
    for &value in x[..peak].iter().rev() {
        if value > height {
            break;
        }
        base = base.min(value);
    }
    base
}

fn right_base(x: &[f64], peak: usize) -> f64 {
    let height = x[peak];
    let mut base = height;
    for &value in &x[peak + 1..] {
        if value > height {
            break;
        }
        base = base.min(value);
    }
    base
}

/// Height above the higher of the two bounding valleys.
fn prominence(x: &[f64], peak: usize) -> f64 {
    x[peak] - left_base(x, peak).max(right_base(x, peak))
}

fn left_prominence(x: &[f64], peak: usize) -> f64 {
    x[peak] - left_base(x, peak)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_interior_peaks_above_prominence() {
        let x = [0.0, 2.0, 1.0, 5.0, 0.0, 0.3, 0.0];
        assert_eq!(prominent_peaks(&x, 0.5, false), vec![1, 3]);
        assert_eq!(prominent_peaks(&x, 0.2, false), vec![1, 3, 5]);
        assert_eq!(prominent_peaks(&x, 4.5, false), vec![3]);
    }

    #[test]
    fn prominence_uses_the_higher_valley() {
        // left valley 1.0 (bounded by the 4.0 peak), right valley 0.0
        let x = [0.0, 4.0, 1.0, 3.0, 0.0];
        assert_eq!(prominence(&x, 3), 2.0);
        assert_eq!(prominence(&x, 1), 4.0);
    }

    #[test]
    fn plateau_reports_middle_sample() {
        let x = [0.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        assert_eq!(prominent_peaks(&x, 0.5, false), vec![2]);
    }

    #[test]
    fn edges_are_not_peaks_without_trailing_option() {
        let x = [0.0, 0.0, 0.0, 0.8];
        assert!(prominent_peaks(&x, 0.5, false).is_empty());
        assert_eq!(prominent_peaks(&x, 0.5, true), vec![3]);
        assert!(prominent_peaks(&x, 0.9, true).is_empty());
    }

    #[test]
    fn flat_or_falling_tail_is_not_a_trailing_peak() {
        assert!(prominent_peaks(&[1.0, 1.0, 1.0], 0.0, true).is_empty());
        assert!(prominent_peaks(&[3.0, 2.0, 1.0], 0.0, true).is_empty());
        assert!(prominent_peaks(&[], 0.0, true).is_empty());
    }
}
