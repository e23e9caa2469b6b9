//! # PCT-Tokenizer
//!
//! Vector-quantized representation learning for human-pose keypoints.
//!
//! A pose is encoded into a small sequence of discrete "compositional
//! tokens" drawn from a learned codebook, and decoded from those tokens back
//! into joint coordinates:
//!
//! 1. **Encoder**: embeds joint coordinates (optionally fused with
//!    image-derived guidance features), masks invisible joints with a shared
//!    learned token, mixes across joints and channels, and projects onto a
//!    fixed number of token slots.
//! 2. **Vector Quantizer**: nearest-neighbor assignment against a codebook
//!    maintained by distributed exponential-moving-average clustering, with a
//!    straight-through estimator for the encoder gradient.
//! 3. **Decoder**: expands quantized token features back across joint slots
//!    and regresses 2D coordinates.
//!
//! The model runs in two stages: `tokenizer` (jointly learns encoder,
//! decoder, and codebook) and `classifier` (consumes externally predicted
//! token-class probabilities and only needs the decoder and codebook).

pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod init;
pub mod mixer;
pub mod model;
pub mod quantizer;

pub use checkpoint::*;
pub use collective::*;
pub use config::*;
pub use decoder::*;
pub use encoder::*;
pub use init::*;
pub use mixer::*;
pub use model::*;
pub use quantizer::*;
