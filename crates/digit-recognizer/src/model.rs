use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    prelude::*,
};

/// Spatial size after two blocks of (conv 3x3, conv 3x3, pool 2x2): 28 -> 24 -> 12 -> 8 -> 4.
const FEATURE_SIDE: usize = 4;
const FEATURE_CHANNELS: usize = 64;

/// Convolution followed by ReLU and batch normalization.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(channels: [usize; 2], device: &B::Device) -> Self {
        let conv = Conv2dConfig::new(channels, [3, 3]).init(device);
        let norm = BatchNormConfig::new(channels[1]).init(device);

        Self {
            conv,
            norm,
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.activation.forward(x);

        self.norm.forward(x)
    }
}

/// Digit classifier: two convolution blocks with pooling and dropout, then a dense head.
#[derive(Module, Debug)]
pub struct DigitCnn<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    block3: ConvBlock<B>,
    block4: ConvBlock<B>,
    pool: MaxPool2d,
    conv_dropout: Dropout,
    dense: Linear<B>,
    dense_norm: BatchNorm<B, 0>,
    dense_dropout: Dropout,
    output: Linear<B>,
    activation: Relu,
}

#[derive(Config, Debug)]
pub struct DigitCnnConfig {
    #[config(default = 10)]
    pub num_classes: usize,
    #[config(default = 512)]
    pub hidden_size: usize,
    #[config(default = 0.25)]
    pub conv_dropout: f64,
    #[config(default = 0.5)]
    pub dense_dropout: f64,
}

impl DigitCnnConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> DigitCnn<B> {
        DigitCnn {
            block1: ConvBlock::new([1, 32], device),
            block2: ConvBlock::new([32, 32], device),
            block3: ConvBlock::new([32, 64], device),
            block4: ConvBlock::new([64, FEATURE_CHANNELS], device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv_dropout: DropoutConfig::new(self.conv_dropout).init(),
            dense: LinearConfig::new(
                FEATURE_CHANNELS * FEATURE_SIDE * FEATURE_SIDE,
                self.hidden_size,
            )
            .init(device),
            dense_norm: BatchNormConfig::new(self.hidden_size).init(device),
            dense_dropout: DropoutConfig::new(self.dense_dropout).init(),
            output: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

impl<B: Backend> DigitCnn<B> {
    /// # Shapes
    ///   - Images [batch_size, 1, height, width]
    ///   - Output [batch_size, num_classes] (logits)
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _channels, _height, _width] = images.dims();

        let x = self.block1.forward(images);
        let x = self.block2.forward(x);
        let x = self.pool.forward(x);
        let x = self.conv_dropout.forward(x);

        let x = self.block3.forward(x);
        let x = self.block4.forward(x);
        let x = self.pool.forward(x);
        let x = self.conv_dropout.forward(x);

        let x = x.reshape([batch_size, FEATURE_CHANNELS * FEATURE_SIDE * FEATURE_SIDE]);
        let x = self.dense.forward(x);
        let x = self.activation.forward(x);
        let x = self.dense_norm.forward(x);
        let x = self.dense_dropout.forward(x);

        self.output.forward(x)
    }
}
