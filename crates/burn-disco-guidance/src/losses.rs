//! Guidance losses
//!
//! All losses are differentiable. Image losses take `[n, 3, h, w]` tensors in
//! `[-1, 1]`.

use burn::prelude::*;

/// Abramowitz & Stegun 4.4.46 coefficients for `asin` on `[0, 1]`
const ASIN_COEFFS: [f64; 8] = [
    1.5707963050,
    -0.2145988016,
    0.0889789874,
    -0.0501743046,
    0.0308918810,
    -0.0170881256,
    0.0066700901,
    -0.0012624911,
];

/// Total variation per sample `[n]`
///
/// Differences across the right and bottom edges are zero, as with
/// replicate padding.
pub fn tv_loss<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    let [n, c, h, w] = x.dims();
    let dx = x.clone().slice([0..n, 0..c, 0..h, 1..w]) - x.clone().slice([0..n, 0..c, 0..h, 0..w - 1]);
    let dy = x.clone().slice([0..n, 0..c, 1..h, 0..w]) - x.slice([0..n, 0..c, 0..h - 1, 0..w]);
    let sum = |d: Tensor<B, 4>| d.powf_scalar(2.0).flatten::<2>(1, 3).sum_dim(1);
    ((sum(dx) + sum(dy)) / (c * h * w) as f64).squeeze::<1>(1)
}

/// Squared excursion outside `[-1, 1]`, mean per sample `[n]`
pub fn range_loss<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    (x.clone() - x.clamp(-1.0, 1.0))
        .powf_scalar(2.0)
        .flatten::<2>(1, 3)
        .mean_dim(1)
        .squeeze::<1>(1)
}

/// Mean absolute clamp violation `[1]`
pub fn sat_loss<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    (x.clone() - x.clamp(-1.0, 1.0)).abs().mean()
}

/// Row-wise L2 normalization
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
    x / norm
}

/// Pairwise spherical distance `[a, b]` between rows of `x` `[a, d]` and `y` `[b, d]`
///
/// `2 * asin(|x̂ - ŷ| / 2)^2` on unit-normalized rows.
pub fn spherical_dist_loss<B: Backend>(x: Tensor<B, 2>, y: Tensor<B, 2>) -> Tensor<B, 2> {
    let cos = l2_normalize(x).matmul(l2_normalize(y).transpose());
    let chord_sq = (cos.neg() + 1.0) * 2.0;
    let half_chord = chord_sq.clamp_min(1e-12).sqrt() / 2.0;
    let angle = asin_unit(half_chord.clamp(0.0, 1.0 - 1e-6));
    angle.powf_scalar(2.0) * 2.0
}

/// `asin` for inputs in `[0, 1)`, absolute error below 2e-8
fn asin_unit<B: Backend, const D: usize>(z: Tensor<B, D>) -> Tensor<B, D> {
    let mut poly = z.clone() * ASIN_COEFFS[7] + ASIN_COEFFS[6];
    for &coeff in ASIN_COEFFS[..6].iter().rev() {
        poly = poly * z.clone() + coeff;
    }
    (z.neg() + 1.0).sqrt() * poly.neg() + std::f64::consts::FRAC_PI_2
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn values<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.to_data().to_vec().unwrap()
    }

    #[test]
    fn test_asin_unit() {
        let device = Default::default();
        let points = [0.0f32, 0.1, 0.5, 0.9, 0.999];
        let z = Tensor::<TestBackend, 1>::from_floats(points, &device);
        for (got, x) in values(asin_unit(z)).iter().zip(points) {
            assert!((got - x.asin()).abs() < 1e-5, "asin({}) = {}", x, got);
        }
    }

    #[test]
    fn test_tv_loss() {
        let device = Default::default();
        let flat = Tensor::<TestBackend, 4>::ones([2, 3, 4, 4], &device);
        assert!(values(tv_loss(flat)).iter().all(|v| v.abs() < 1e-7));

        // Unit step between two columns: 4 rows * 3 channels of 1.0 over 48 pixels
        let data: Vec<f32> = (0..48).map(|i| if i % 4 >= 2 { 1.0 } else { 0.0 }).collect();
        let step = Tensor::<TestBackend, 4>::from_data(TensorData::new(data, [1, 3, 4, 4]), &device);
        let tv = values(tv_loss(step));
        assert!((tv[0] - 12.0 / 48.0).abs() < 1e-6);
    }

    #[test]
    fn test_range_and_sat() {
        let device = Default::default();
        let data = vec![0.5f32, 2.0, -3.0, 1.0];
        let x = Tensor::<TestBackend, 4>::from_data(TensorData::new(data, [1, 1, 2, 2]), &device);
        assert!((values(range_loss(x.clone()))[0] - (1.0 + 4.0) / 4.0).abs() < 1e-6);
        assert!((values(sat_loss(x))[0] - (1.0 + 2.0) / 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_spherical_distance() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [0.0, 3.0]], &device);
        let y = Tensor::<TestBackend, 2>::from_floats([[2.0, 0.0], [0.0, 1.0], [-1.0, 0.0]], &device);
        let d = values(spherical_dist_loss(x, y));
        assert_eq!(d.len(), 6);

        let quarter = std::f32::consts::FRAC_PI_4;
        let half = std::f32::consts::FRAC_PI_2;
        // identical direction, orthogonal, opposite
        assert!(d[0].abs() < 1e-5);
        assert!((d[1] - 2.0 * quarter * quarter).abs() < 1e-4);
        assert!((d[2] - 2.0 * half * half).abs() < 2e-2);
        assert!((d[3] - 2.0 * quarter * quarter).abs() < 1e-4);
    }

    #[test]
    fn test_spherical_distance_gradient_finite() {
        type Ad = Autodiff<TestBackend>;
        let device = Default::default();
        let x = Tensor::<Ad, 2>::from_floats([[1.0, 0.2, -0.3]], &device).require_grad();
        let y = Tensor::<Ad, 2>::from_floats([[1.0, 0.2, -0.3], [0.0, 1.0, 0.0]], &device);
        let grads = spherical_dist_loss(x.clone(), y).sum().backward();
        let g: Vec<f32> = x.grad(&grads).unwrap().to_data().to_vec().unwrap();
        assert!(g.iter().all(|v| v.is_finite()));
    }
}
