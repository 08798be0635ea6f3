// Domain layer: values, schemas, queries and the ports the pipeline core talks through.

pub mod model;
pub mod ports;
pub mod query;
pub mod schema;
