// Application layer: pipelines assembled from configuration.

pub mod sync_pipeline;

pub use sync_pipeline::SyncPipeline;
