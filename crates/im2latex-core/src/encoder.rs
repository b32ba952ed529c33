use tch::{nn, Kind, Tensor};

use crate::config::ModelConfig;
use crate::layer_norm::RMSNorm;
use crate::transformer::EncoderBlock;

/// Patch encoder: a strided convolution cuts the image into patches, a
/// learned table adds 2D positions, transformer blocks mix the patches.
pub struct Encoder {
    patch_embed: nn::Conv2D,
    pos_emb: Tensor,
    blocks: Vec<EncoderBlock>,
    norm: RMSNorm,
    grid_width: i64,
    dropout: f64,
}

impl Encoder {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let conv_config = nn::ConvConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let patch_embed = nn::conv2d(
            vs / "patch_embed",
            config.channels,
            config.dim,
            config.patch_size,
            conv_config,
        );
        let pos_emb = vs.var(
            "pos_emb",
            &[config.grid_height() * config.grid_width(), config.dim],
            nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        );
        let blocks = (0..config.encoder_depth)
            .map(|i| EncoderBlock::new(&(vs / "blocks" / i), config))
            .collect();

        Self {
            patch_embed,
            pos_emb,
            blocks,
            norm: RMSNorm::new(&(vs / "norm"), config.dim, config.layer_norm_epsilon),
            grid_width: config.grid_width(),
            dropout: config.dropout,
        }
    }

    /// images: [batch, channels, height, width] with sides that are multiples
    /// of the patch size. Returns the context: [batch, patches, dim].
    pub fn forward_t(&self, images: &Tensor, train: bool) -> Tensor {
        let patches = images.apply(&self.patch_embed);
        let size = patches.size();
        let (grid_h, grid_w) = (size[2], size[3]);
        let device = patches.device();

        // Row-major lookup into the max-size position table.
        let rows = Tensor::arange(grid_h, (Kind::Int64, device)).unsqueeze(1) * self.grid_width;
        let cols = Tensor::arange(grid_w, (Kind::Int64, device)).unsqueeze(0);
        let positions = (rows + cols).view([-1]);

        let mut x = patches.flatten(2, -1).transpose(1, 2)
            + self.pos_emb.index_select(0, &positions).unsqueeze(0);
        x = x.dropout(self.dropout, train);
        for block in &self.blocks {
            x = block.forward_t(&x, train);
        }
        self.norm.forward(&x)
    }
}
