pub mod audit;
pub mod cache;
pub mod encryption;
pub mod transform;
pub mod transforms;
pub mod writer;

pub use crate::domain::ports::{Connection, RunObserver};
pub use crate::utils::error::Result;
pub use transform::{Reader, Transform, TransformStats};
