//! Mirror symmetry applied to the sample at chosen steps

use std::collections::BTreeSet;

use burn::prelude::*;

/// Mirror the left half onto the right and/or the top half onto the bottom
pub fn symmetrize<B: Backend>(x: Tensor<B, 4>, horizontal: bool, vertical: bool) -> Tensor<B, 4> {
    let mut x = x;
    if horizontal {
        x = mirror(x, 3);
    }
    if vertical {
        x = mirror(x, 2);
    }
    x
}

/// Mirror along height (`dim == 2`) or width (`dim == 3`)
fn mirror<B: Backend>(x: Tensor<B, 4>, dim: usize) -> Tensor<B, 4> {
    let dims = x.dims();
    let len = dims[dim];
    let half = len / 2;
    if half == 0 {
        return x;
    }
    let mut ranges = dims.map(|d| 0..d);
    ranges[dim] = 0..half;
    let first = x.clone().slice(ranges.clone());
    let mut parts = vec![first.clone()];
    if len % 2 == 1 {
        ranges[dim] = half..half + 1;
        parts.push(x.slice(ranges));
    }
    parts.push(match dim {
        2 => first.flip([2]),
        _ => first.flip([3]),
    });
    Tensor::cat(parts, dim)
}

/// Loop indices at which the symmetry transform runs
pub fn transformation_steps(steps: usize, percents: &[f64]) -> BTreeSet<usize> {
    percents
        .iter()
        .map(|p| (steps as f64 * p) as usize)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn row(values: Vec<f32>) -> Tensor<TestBackend, 4> {
        let w = values.len();
        Tensor::from_data(TensorData::new(values, [1, 1, 1, w]), &Default::default())
    }

    #[test]
    fn test_horizontal_even() {
        let out: Vec<f32> = symmetrize(row(vec![1.0, 2.0, 3.0, 4.0]), true, false)
            .to_data()
            .to_vec()
            .unwrap();
        assert_eq!(out, vec![1.0, 2.0, 2.0, 1.0]);
    }

    #[test]
    fn test_horizontal_odd_keeps_middle() {
        let out: Vec<f32> = symmetrize(row(vec![1.0, 2.0, 3.0, 4.0, 5.0]), true, false)
            .to_data()
            .to_vec()
            .unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_vertical() {
        let data = vec![1.0f32, 2.0, 3.0, 4.0];
        let x = Tensor::<TestBackend, 4>::from_data(TensorData::new(data, [1, 1, 4, 1]), &Default::default());
        let out: Vec<f32> = symmetrize(x.clone(), false, true).to_data().to_vec().unwrap();
        assert_eq!(out, vec![1.0, 2.0, 2.0, 1.0]);
        let same: Vec<f32> = symmetrize(x, false, false).to_data().to_vec().unwrap();
        assert_eq!(same, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_transformation_steps() {
        let steps = transformation_steps(250, &[0.09, 0.5]);
        assert_eq!(steps.into_iter().collect::<Vec<_>>(), vec![22, 125]);
    }
}
