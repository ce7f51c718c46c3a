pub mod cancel;
pub mod canon;
pub mod error;
pub mod function;
pub mod rect;
pub mod table;
pub mod value;

pub use cancel::CancelToken;
pub use canon::{canonical_json, hash_canonical, sha256_hex};
pub use error::{FlowError, FlowErrorExtra, FlowErrorKind};
pub use function::{ArgKind, ArgSpec, BUILTIN_FUNCTIONS, FunctionIndex, FunctionSpec};
pub use rect::{Rect, cell_a1, col_letters, quote_sheet_name};
pub use table::{Column, DataType, FromGridOptions, RowStream, Table, TableStream};
pub use value::Value;
