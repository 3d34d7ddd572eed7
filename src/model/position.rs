use burn::tensor::{backend::Backend, Data, Shape, Tensor};

/// Fixed sinusoidal position signal of shape `[length, d_model]`.
///
/// Even channels carry `sin(pos / 10000^(i/d))`, odd channels the matching cosine.
/// The table is rebuilt from constants on every call, so it never receives gradients.
pub fn sinusoidal_positions<B: Backend>(
    length: usize,
    d_model: usize,
    device: &B::Device,
) -> Tensor<B, 2> {
    let mut table = vec![0.0f32; length * d_model];
    let scale = -(10_000f64.ln()) / d_model as f64;

    for pos in 0..length {
        for i in (0..d_model).step_by(2) {
            let angle = pos as f64 * (i as f64 * scale).exp();
            table[pos * d_model + i] = angle.sin() as f32;
            if i + 1 < d_model {
                table[pos * d_model + i + 1] = angle.cos() as f32;
            }
        }
    }

    Tensor::from_data(
        Data::new(table, Shape::new([length, d_model])).convert::<B::FloatElem>(),
        device,
    )
}

/// Adds the sinusoidal signal to every sequence of a `[batch, length, d_model]` tensor.
pub fn add_positions<B: Backend>(input: Tensor<B, 3>) -> Tensor<B, 3> {
    let [batch_size, length, d_model] = input.dims();
    let positions = sinusoidal_positions::<B>(length, d_model, &input.device())
        .unsqueeze::<3>()
        .repeat(0, batch_size);
    input + positions
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn first_position_is_sin_zero_cos_one() {
        let table = sinusoidal_positions::<TestBackend>(3, 4, &Default::default());
        let values = table.into_data().convert::<f32>().value;
        assert_eq!(&values[0..4], &[0.0, 1.0, 0.0, 1.0]);
        assert!((values[4] - 1f32.sin()).abs() < 1e-6);
        assert!((values[5] - 1f32.cos()).abs() < 1e-6);
    }

    #[test]
    fn positions_are_shared_across_the_batch() {
        let input = Tensor::<TestBackend, 3>::zeros([2, 3, 4], &Default::default());
        let values = add_positions(input).into_data().convert::<f32>().value;
        assert_eq!(values[..12], values[12..]);
    }
}
