// Adapters layer: concrete connections the pipeline core reads from and writes to.

pub mod csv_file;
pub mod memory;

pub use memory::MemoryConnection;
