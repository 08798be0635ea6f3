pub mod aggregate;
pub mod concat;
pub mod delta;
pub mod filter;
pub mod group;
pub mod join;
pub mod lookup;
pub mod mapping;
pub mod memory;
pub mod series;
pub mod sort;
pub mod validation;

pub use aggregate::{AggregateFunction, AggregateKind, BuiltinAggregate};
pub use concat::ConcatTransform;
pub use delta::{DeltaConfig, DeltaTransform, Operation, UpdateStrategy, OPERATION_COLUMN};
pub use filter::FilterTransform;
pub use group::{AggregateColumn, GroupConfig, GroupTransform};
pub use join::{DuplicateStrategy, JoinConfig, JoinFilter, JoinKey, JoinSide, JoinTransform, NotFoundStrategy};
pub use lookup::{LookupConfig, LookupTransform};
pub use mapping::{Mapping, MappingFunction, MappingTransform};
pub use memory::MemoryTransform;
pub use series::{SeriesColumn, SeriesConfig, SeriesFunction, SeriesStep, SeriesTransform};
pub use sort::SortTransform;
pub use validation::{ColumnValidation, ValidationAction, ValidationRule, ValidationTransform};
