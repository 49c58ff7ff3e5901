use candle_core::{Module, Result, Tensor, D};
use candle_nn::{
    batch_norm, conv2d, linear, lstm, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, LSTMConfig,
    Linear, LSTM, RNN, VarBuilder,
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrnnConfig {
    pub n_mfcc: usize,
    pub frames: usize,
    pub conv1_channels: usize,
    pub conv2_channels: usize,
    pub lstm_hidden: usize,
    pub num_labels: usize,
}

impl CrnnConfig {
    /// Each conv block halves both spatial axes.
    pub fn lstm_input_dim(&self) -> usize {
        self.conv2_channels * (self.n_mfcc / 4)
    }

    pub fn time_steps(&self) -> usize {
        self.frames / 4
    }
}

impl Default for CrnnConfig {
    fn default() -> Self {
        Self {
            n_mfcc: crate::config::DEFAULT_N_MFCC,
            frames: crate::config::DEFAULT_MAX_FRAMES,
            conv1_channels: 16,
            conv2_channels: 32,
            lstm_hidden: 128,
            num_labels: crate::emotion::EmotionLabel::COUNT,
        }
    }
}

#[derive(Clone, Debug)]
struct ConvBlock {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBlock {
    fn new(in_c: usize, out_c: usize, conv_vb: VarBuilder, bn_vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(in_c, out_c, 3, cfg, conv_vb)?,
            bn: batch_norm(out_c, BatchNormConfig::default(), bn_vb)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv
            .forward(xs)?
            .apply_t(&self.bn, false)?
            .relu()?
            .max_pool2d(2)
    }
}

/// Two conv blocks over the (coefficient, frame) plane, an LSTM over the
/// pooled time axis, and a linear head. Parameter names follow the PyTorch
/// state dict of the trained model (`conv1.*`, `bn1.*`, `lstm.*`, `fc.*`).
#[derive(Clone, Debug)]
pub struct CrnnModel {
    block1: ConvBlock,
    block2: ConvBlock,
    lstm: LSTM,
    fc: Linear,
    config: CrnnConfig,
}

impl CrnnModel {
    pub fn new(config: CrnnConfig, vb: VarBuilder) -> Result<Self> {
        let block1 = ConvBlock::new(1, config.conv1_channels, vb.pp("conv1"), vb.pp("bn1"))?;
        let block2 = ConvBlock::new(
            config.conv1_channels,
            config.conv2_channels,
            vb.pp("conv2"),
            vb.pp("bn2"),
        )?;
        let lstm = lstm(
            config.lstm_input_dim(),
            config.lstm_hidden,
            LSTMConfig::default(),
            vb.pp("lstm"),
        )?;
        let fc = linear(config.lstm_hidden, config.num_labels, vb.pp("fc"))?;
        Ok(Self {
            block1,
            block2,
            lstm,
            fc,
            config,
        })
    }

    pub fn config(&self) -> &CrnnConfig {
        &self.config
    }

    /// Maps `(batch, n_mfcc, frames)` features to `(batch, num_labels)` logits.
    pub fn logits(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.unsqueeze(1)?;
        let xs = self.block2.forward(&self.block1.forward(&xs)?)?;

        // (b, c, h, w) -> (b, w, c * h): the pooled frame axis becomes time.
        let (b, c, h, w) = xs.dims4()?;
        let seq = xs.permute((0, 3, 1, 2))?.reshape((b, w, c * h))?;

        let states = self.lstm.seq(&seq)?;
        let last = states
            .last()
            .ok_or_else(|| candle_core::Error::Msg("lstm received an empty sequence".into()))?;
        self.fc.forward(last.h())
    }

    /// Softmax over the label axis.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::ops::softmax(&self.logits(xs)?, D::Minus1)
    }
}
