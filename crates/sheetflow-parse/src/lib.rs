pub mod ast;
pub mod parser;
pub mod query;
pub mod script;
pub mod tokenizer;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use parser::{Parser, ParserError, parse_expression};
pub use query::{
    AggregateOp, Aggregation, ColumnTransform, CompareOp, FilterPredicate, JoinAlgorithm,
    JoinMode, JoinType, NameTransform, Operation, Query, SortDirection, SortKey, SourceSpec, Step,
};
pub use script::{compile_script, lower_predicate};
pub use tokenizer::{Token, TokenKind, Tokenizer, TokenizerError, tokenize};

// Re-export for convenience
pub use sheetflow_common::{DataType, Value};
