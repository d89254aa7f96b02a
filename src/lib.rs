pub mod codebook;
pub mod config;
pub mod distance;
pub mod encoder;
pub mod error;
pub mod kmeans;
pub mod model;
pub mod utils;

pub use codebook::{Codebook, train_codebook};
pub use config::{FitConfig, InitMethod, TrainConfig};
pub use distance::{DistanceStrategy, DistanceTable, QueryDistance, QueryTable, build_distance_table};
pub use encoder::{decode, decode_batch, encode, encode_batch, encode_chunks, reconstruction_error};
pub use error::{FitWarning, PqkError, Result};
pub use kmeans::{CancelToken, FitPhase, FitResult, IterationStats, PqKMeans, Termination, assign, fit};
pub use model::{PqKMeansModel, load_codebook, predict, save_codebook};
