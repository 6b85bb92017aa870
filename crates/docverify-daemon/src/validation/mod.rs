//! Field reconciliation across independently produced agent outputs.

pub mod cross;
pub mod dates;
pub mod names;

pub use cross::{CrossValidation, CrossValidationInput, CrossValidator, FieldMatch};
pub use dates::{DateComparison, compare_dates, parse_date};
pub use names::{NameComparison, compare_names, indel_ratio, normalize_name, token_sort_ratio};
