use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    tensor::{activation::gelu, backend::Backend, Tensor},
};

#[derive(Config, Debug)]
pub struct LatentClassifierConfig {
    pub d_model: usize,
    pub num_labels: usize,
    #[config(default = 0.3)]
    pub dropout: f64,
}

impl LatentClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LatentClassifier<B> {
        LatentClassifier {
            linear1: LinearConfig::new(self.d_model, 256).init(device),
            linear2: LinearConfig::new(256, 128).init(device),
            linear3: LinearConfig::new(128, self.num_labels).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            num_labels: self.num_labels,
        }
    }
}

/// Three-layer head that predicts the label from the hidden state.
#[derive(Module, Debug)]
pub struct LatentClassifier<B: Backend> {
    linear1: Linear<B>,
    linear2: Linear<B>,
    linear3: Linear<B>,
    dropout: Dropout,
    num_labels: usize,
}

impl<B: Backend> LatentClassifier<B> {
    /// `[batch, memory, d_model]` to `[batch, num_labels]` logits, max-pooling the memory axis.
    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 2> {
        // Pool over the last axis: the ndarray backward of max_dim only scatters along it.
        let pooled: Tensor<B, 2> = hidden.swap_dims(1, 2).max_dim(2).squeeze(2);

        let x = self.dropout.forward(gelu(self.linear1.forward(pooled)));
        let x = self.dropout.forward(gelu(self.linear2.forward(x)));
        self.linear3.forward(x)
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }
}
