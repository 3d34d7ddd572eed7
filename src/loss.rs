// Losses of both training phases and of the adversarial gradient.

use burn::{
    nn::loss::CrossEntropyLossConfig,
    tensor::{activation::log_softmax, backend::Backend, Distribution, Int, Tensor},
};

/// Label-smoothed cross entropy of `[batch, length, vocab]` logits against the source
/// tokens, ignoring padding positions.
pub fn reconstruction_loss<B: Backend>(
    logits: Tensor<B, 3>,
    targets: Tensor<B, 2, Int>,
    pad_token: usize,
    smoothing: f32,
) -> Tensor<B, 1> {
    let [batch_size, seq_length, vocab_size] = logits.dims();
    let device = logits.device();

    CrossEntropyLossConfig::new()
        .with_pad_tokens(Some(vec![pad_token]))
        .with_smoothing((smoothing > 0.0).then_some(smoothing))
        .init(&device)
        .forward(
            logits.reshape([batch_size * seq_length, vocab_size]),
            targets.reshape([batch_size * seq_length]),
        )
}

/// Label-smoothed cross entropy against integer labels.
pub fn classification_loss<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
    smoothing: f32,
) -> Tensor<B, 1> {
    CrossEntropyLossConfig::new()
        .with_smoothing((smoothing > 0.0).then_some(smoothing))
        .init(&logits.device())
        .forward(logits, labels)
}

/// Cross entropy against a probability distribution per row, averaged over the batch.
pub fn soft_cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    (targets * log_softmax(logits, 1))
        .sum_dim(1)
        .mean()
        .neg()
}

/// Biased Gaussian-kernel MMD² between two samples of `d`-dimensional points.
///
/// The kernel bandwidth is `2 * d * variance`. Each kernel block is averaged, so the
/// value does not depend on the sample sizes and never goes below zero.
pub fn mmd_between<B: Backend>(x: Tensor<B, 2>, y: Tensor<B, 2>, variance: f64) -> Tensor<B, 1> {
    let [_, dim] = x.dims();
    let bandwidth = 2.0 * dim as f64 * variance;

    let xx = gaussian_kernel(x.clone(), x.clone(), bandwidth).mean();
    let yy = gaussian_kernel(y.clone(), y.clone(), bandwidth).mean();
    let xy = gaussian_kernel(x, y, bandwidth).mean();

    (xx + yy - xy.mul_scalar(2.0)).clamp_min(0.0)
}

/// MMD² between `latent` and as many draws from `N(0, variance * I)`.
pub fn compute_mmd<B: Backend>(latent: Tensor<B, 2>, variance: f64) -> Tensor<B, 1> {
    let device = latent.device();
    let prior = Tensor::random(
        latent.shape(),
        Distribution::Normal(0.0, variance.sqrt()),
        &device,
    );
    mmd_between(latent, prior, variance)
}

fn gaussian_kernel<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>, bandwidth: f64) -> Tensor<B, 2> {
    let [n, _] = a.dims();
    let [m, _] = b.dims();

    let a = a.unsqueeze_dim::<3>(1).repeat(1, m);
    let b = b.unsqueeze_dim::<3>(0).repeat(0, n);
    let diff = a - b;
    let squared_distance: Tensor<B, 2> = (diff.clone() * diff).sum_dim(2).squeeze(2);

    squared_distance.div_scalar(bandwidth).neg().exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::NdArray,
        tensor::{Data, ElementConversion, Shape},
    };

    type TestBackend = NdArray<f32>;

    fn scalar(tensor: Tensor<TestBackend, 1>) -> f64 {
        tensor.into_scalar().elem::<f64>()
    }

    #[test]
    fn mmd_of_identical_samples_is_zero() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::random([16, 4], Distribution::Default, &device);
        assert!(scalar(mmd_between(x.clone(), x, 2.0)).abs() < 1e-5);
    }

    #[test]
    fn mmd_grows_with_distance_and_stays_non_negative() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::random([16, 4], Distribution::Normal(0.0, 1.0), &device);
        let near = x.clone().add_scalar(0.5);
        let far = x.clone().add_scalar(5.0);

        let near = scalar(mmd_between(x.clone(), near, 1.0));
        let far = scalar(mmd_between(x.clone(), far, 1.0));
        assert!(near > 0.0);
        assert!(far > near);
        assert!(scalar(compute_mmd(x, 2.0)) >= 0.0);
    }

    #[test]
    fn soft_cross_entropy_matches_hard_labels_on_one_hot_targets() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            Data::new(vec![2.0f32, 0.5, -1.0, 0.0, 1.0, 3.0], Shape::new([2, 3])),
            &device,
        );
        let one_hot = Tensor::<TestBackend, 2>::from_data(
            Data::new(vec![1.0f32, 0.0, 0.0, 0.0, 0.0, 1.0], Shape::new([2, 3])),
            &device,
        );
        let labels = Tensor::<TestBackend, 1, Int>::from_data(
            Data::new(vec![0i64, 2], Shape::new([2])),
            &device,
        );

        let soft = scalar(soft_cross_entropy(logits.clone(), one_hot));
        let hard = scalar(classification_loss(logits, labels, 0.0));
        assert!((soft - hard).abs() < 1e-5);
    }

    #[test]
    fn padding_positions_do_not_change_reconstruction_loss() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 3>::random([1, 3, 5], Distribution::Default, &device);
        let targets = Tensor::<TestBackend, 2, Int>::from_data(
            Data::new(vec![1i64, 4, 0], Shape::new([1, 3])),
            &device,
        );
        let mut other = logits.clone().into_data().convert::<f32>().value;
        // Rewrite the logits of the padded third position only.
        for value in &mut other[10..15] {
            *value = 7.0;
        }
        let other = Tensor::<TestBackend, 3>::from_data(
            Data::new(other, Shape::new([1, 3, 5])),
            &device,
        );

        let a = scalar(reconstruction_loss(logits, targets.clone(), 0, 0.1));
        let b = scalar(reconstruction_loss(other, targets, 0, 0.1));
        assert!((a - b).abs() < 1e-6);
    }
}
