pub mod candle_aux_layers;
pub mod candle_bayesian;
pub mod candle_checkpoint;
pub mod candle_classifier;
pub mod candle_data_loader;
pub mod candle_ema;
pub mod candle_flow_inference;
pub mod candle_flow_model;
pub mod candle_latent;
pub mod candle_loss_functions;
pub mod candle_loss_history;
pub mod candle_model_traits;
pub mod candle_optimizer;
pub mod candle_prediction;
pub mod candle_scheduler;
pub mod candle_variational_linear;
pub mod cli;
pub mod config;
pub mod error;
pub mod flow;
pub mod unfolding;

pub use candle_core;
pub use candle_nn;
